//! AL state machine driver: observe, request and repair slave states.

use crate::{
    al_status_code::AlStatusCode,
    error::Error,
    link::Link,
    master::Master,
    register::RegisterAddress,
    sii,
    slave_state::{AlControl, AlStatus, SlaveState},
    wire::WireRead,
    MAX_FMMU, MAX_SM, TEMP_NODE,
};
use core::time::Duration;

impl<L: Link> Master<L> {
    /// Request a state from one slave, or from every slave when `slave` is 0.
    ///
    /// The request is the first of the two transition layers; use
    /// [`state_check`](Self::state_check) to observe the outcome.
    pub fn write_state(&self, slave: u16, state: SlaveState) -> Result<u16, Error> {
        self.write_al_control(slave, AlControl::new(state))
    }

    /// Request a state while acknowledging a pending error, e.g. writing
    /// SAFE-OP + ACK to leave SAFE-OP + ERROR.
    pub fn ack_state(&self, slave: u16, state: SlaveState) -> Result<u16, Error> {
        self.write_al_control(slave, AlControl::acknowledging(state))
    }

    pub(crate) fn write_al_control(&self, slave: u16, control: AlControl) -> Result<u16, Error> {
        if slave == 0 {
            self.bwr(
                RegisterAddress::AlControl.into(),
                control,
                self.timeouts.pdu3(),
            )
        } else {
            let configured_address = self.slave(slave)?.configured_address();

            self.fpwr(
                configured_address,
                RegisterAddress::AlControl.into(),
                control,
                self.timeouts.pdu3(),
            )
        }
    }

    /// Poll until `slave` reaches `state` or `timeout` elapses, with gently
    /// widening poll intervals.
    ///
    /// `slave` 0 checks the lowest common state across all slaves. Returns
    /// the state actually observed last.
    pub fn state_check(
        &self,
        slave: u16,
        state: SlaveState,
        timeout: Duration,
    ) -> Result<SlaveState, Error> {
        let deadline = std::time::Instant::now() + timeout;
        let mut pause = self.timeouts.wait_loop_delay;

        loop {
            let observed = if slave == 0 {
                self.read_state()?
            } else {
                self.read_slave_state(slave)?
            };

            if observed == state || std::time::Instant::now() >= deadline {
                return Ok(observed);
            }

            std::thread::sleep(pause);

            // Widen up to 1 ms so a slow transition isn't hammered
            pause = (pause * 2).min(Duration::from_millis(1));
        }
    }

    fn read_slave_state(&self, slave: u16) -> Result<SlaveState, Error> {
        let rec = self.slave(slave)?;
        let configured_address = rec.configured_address();

        // AL status and AL status code sit 4 bytes apart; one read covers both
        let mut raw = [0u8; 6];

        let wkc = self.port.fprd(
            configured_address,
            RegisterAddress::AlStatus.into(),
            &mut raw,
            self.timeouts.pdu3(),
        )?;

        if wkc == 0 {
            rec.set_state(SlaveState::None);
            rec.set_lost(true);

            return Ok(SlaveState::None);
        }

        let status = AlStatus::unpack_from_slice(&raw)?;
        let code = u16::from_le_bytes([raw[4], raw[5]]);

        rec.set_state(status.state);
        rec.set_al_status_code(AlStatusCode::from(code));

        Ok(status.state)
    }

    /// Refresh every slave's recorded state and AL status code.
    ///
    /// Fast path: one broadcast read. When the segment reports mixed states
    /// or an error flag, each slave is interrogated individually. Returns the
    /// lowest common state, which is also recorded on the pseudo-slave 0.
    pub fn read_state(&self) -> Result<SlaveState, Error> {
        let (raw, wkc) = self.brd::<u16>(RegisterAddress::AlStatus.into(), self.timeouts.pdu3())?;

        if wkc == 0 {
            for rec in self.slaves() {
                rec.set_state(SlaveState::None);
            }

            return Ok(SlaveState::None);
        }

        // A broadcast read ORs all AL status registers together: a clean
        // value with no error bit, acknowledged by every slave, means they
        // all agree.
        let all_agree = usize::from(wkc) == self.slave_count()
            && raw & crate::slave_state::STATE_ACK_OR_ERROR == 0
            && matches!(raw & 0x0f, 0x01 | 0x02 | 0x03 | 0x04 | 0x08);

        let lowest = if all_agree {
            let state = SlaveState::from((raw & 0x0f) as u8);

            for rec in self.slaves() {
                rec.set_state(state);
                rec.set_al_status_code(AlStatusCode::NoError);
            }

            state
        } else {
            let mut lowest = SlaveState::Op;

            for index in 1..=self.slave_count() as u16 {
                let state = self.read_slave_state(index)?;

                if state.raw() < lowest.raw() {
                    lowest = state;
                }
            }

            lowest
        };

        if let Some(pseudo) = self.slaves.first() {
            pseudo.set_state(lowest);
        }

        Ok(lowest)
    }

    /// Try to re-adopt a slave that lost its configured station address,
    /// e.g. after a power cycle.
    ///
    /// The slave at the original topological position is given the temporary
    /// address, its identity (alias, vendor, product, revision) verified
    /// against the stored record, and only then its original configured
    /// address restored. Returns `true` when the slave answers on its
    /// configured address again.
    pub fn recover_slave(&self, slave: u16, timeout: Duration) -> Result<bool, Error> {
        let (configured_address, position, alias, vendor_id, product_code, revision) = {
            let rec = self.slave(slave)?;

            (
                rec.configured_address(),
                slave - 1,
                rec.alias_address,
                rec.vendor_id,
                rec.product_code,
                rec.revision,
            )
        };

        let mut readback = [0u8; 2];

        let wkc = self.port.aprd(
            position,
            RegisterAddress::ConfiguredStationAddress.into(),
            &mut readback,
            timeout,
        )?;

        let readback = u16::from_le_bytes(readback);

        // The right slave is already answering; nothing to repair
        if readback == configured_address {
            self.slave(slave)?.set_lost(false);

            return Ok(true);
        }

        // Only adopt a device that has no station address at all
        if wkc == 0 || readback != 0 {
            return Ok(false);
        }

        // Evict anything squatting on the temporary address, then claim it
        let _ = self.fpwr::<u16>(
            TEMP_NODE,
            RegisterAddress::ConfiguredStationAddress.into(),
            0,
            self.timeouts.pdu,
        );

        let wkc = self.apwr(
            position,
            RegisterAddress::ConfiguredStationAddress.into(),
            TEMP_NODE,
            timeout,
        )?;

        if wkc == 0 {
            return Ok(false);
        }

        let rec = self.slave(slave)?;

        rec.set_configured_address(TEMP_NODE);

        let restore = |address: u16| {
            rec.set_configured_address(configured_address);

            self.fpwr::<u16>(
                TEMP_NODE,
                RegisterAddress::ConfiguredStationAddress.into(),
                address,
                timeout,
            )
        };

        self.eeprom_to_master(slave)?;

        let (read_alias, _) = self.fprd::<u16>(
            TEMP_NODE,
            RegisterAddress::ConfiguredStationAlias.into(),
            timeout,
        )?;

        let identity_matches = read_alias == alias
            && self.eeprom_read(slave, sii::word::VENDOR_ID, self.timeouts.eeprom)? as u32
                == vendor_id
            && self.eeprom_read(slave, sii::word::PRODUCT_CODE, self.timeouts.eeprom)? as u32
                == product_code
            && self.eeprom_read(slave, sii::word::REVISION, self.timeouts.eeprom)? as u32
                == revision;

        if identity_matches {
            restore(configured_address)?;

            let rec = self.slave(slave)?;

            rec.set_lost(false);

            log::info!(
                "Recovered slave {} at address {:#06x}",
                slave,
                configured_address
            );

            Ok(true)
        } else {
            // Not the device that was here before: release it unaddressed
            restore(0)?;

            log::warn!("Slave {} identity mismatch during recovery", slave);

            Ok(false)
        }
    }

    /// Reconfigure a slave from its stored records: force INIT, reprogram
    /// every enabled sync manager and FMMU, rerun the PRE-OP → SAFE-OP hook
    /// and bring the slave back to SAFE-OP.
    ///
    /// Returns the state the slave ended up in.
    pub fn reconfig_slave(&self, slave: u16, timeout: Duration) -> Result<SlaveState, Error> {
        let configured_address = self.slave(slave)?.configured_address();

        let wkc = self.fpwr(
            configured_address,
            RegisterAddress::AlControl.into(),
            AlControl::new(SlaveState::Init),
            timeout,
        )?;

        if wkc == 0 {
            return Ok(SlaveState::None);
        }

        self.eeprom_to_pdi(slave)?;

        let state = self.state_check(slave, SlaveState::Init, self.timeouts.state_transition)?;

        if state != SlaveState::Init {
            return Ok(state);
        }

        {
            let rec = self.slave(slave)?;

            for index in 0..MAX_SM {
                if rec.sm[index].physical_start_address != 0 {
                    self.fpwr(
                        configured_address,
                        RegisterAddress::sync_manager(index as u8),
                        rec.sm[index],
                        timeout,
                    )?;
                }
            }
        }

        self.fpwr(
            configured_address,
            RegisterAddress::AlControl.into(),
            AlControl::new(SlaveState::PreOp),
            timeout,
        )?;

        let state = self.state_check(slave, SlaveState::PreOp, self.timeouts.state_transition)?;

        if state != SlaveState::PreOp {
            return Ok(state);
        }

        if let Some(Some(hook)) = self.po2so_hooks.get(usize::from(slave)) {
            hook(self, slave)?;
        }

        self.fpwr(
            configured_address,
            RegisterAddress::AlControl.into(),
            AlControl::new(SlaveState::SafeOp),
            timeout,
        )?;

        let state = self.state_check(slave, SlaveState::SafeOp, self.timeouts.state_transition)?;

        {
            let rec = self.slave(slave)?;

            for index in 0..usize::from(rec.fmmu_unused).min(MAX_FMMU) {
                self.fpwr(
                    configured_address,
                    RegisterAddress::fmmu(index as u8),
                    rec.fmmu[index],
                    timeout,
                )?;
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_numeric() {
        // The lowest common state follows raw register ordering
        let order = [
            SlaveState::None,
            SlaveState::Init,
            SlaveState::PreOp,
            SlaveState::Boot,
            SlaveState::SafeOp,
            SlaveState::Op,
        ];

        for pair in order.windows(2) {
            assert!(pair[0].raw() < pair[1].raw());
        }
    }
}
