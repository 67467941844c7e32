//! Distributed clocks: propagation delay measurement, reference clock
//! election, system time alignment and the host PI synchroniser.

use crate::{
    error::Error,
    link::Link,
    master::Master,
    register::RegisterAddress,
    MAX_GROUPS,
};
use core::time::Duration;
use std::sync::atomic::Ordering;

/// The EtherCAT DC epoch (2000-01-01) relative to the Unix epoch, in seconds.
const ECAT_EPOCH_OFFSET_S: i64 = 946_684_800;

/// Margin added to the current system time when arming SYNC generation, so
/// the programmed start time is comfortably in the future.
const SYNC_START_DELAY_NS: u64 = 100_000_000;

/// Host wall clock expressed in the EtherCAT DC epoch, in nanoseconds.
pub fn ethercat_now() -> i64 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    unix.as_nanos() as i64 - ECAT_EPOCH_OFFSET_S * 1_000_000_000
}

impl<L: Link> Master<L> {
    /// Configure distributed clocks: latch port receive times, elect the
    /// first DC capable slave as reference clock, accumulate propagation
    /// delays along the topology and align every slave's system time with
    /// the host clock.
    ///
    /// Returns `true` when a reference clock was found. Cyclic distribution
    /// of the reference time is then piggy-backed onto the process data
    /// exchange.
    pub fn config_dc(&mut self) -> Result<bool, Error> {
        let count = self.slave_count() as u16;

        if count == 0 {
            return Ok(false);
        }

        // Latch the receive time of all ports of all slaves in one broadcast
        self.bwr::<u32>(
            RegisterAddress::DcTimePort0.into(),
            0,
            self.timeouts.pdu3(),
        )?;

        let master_time = ethercat_now();

        let mut reference: u16 = 0;

        for slave in 1..=count {
            if !self.slave(slave)?.has_dc {
                continue;
            }

            let configured_address = self.slave(slave)?.configured_address();

            if reference == 0 {
                reference = slave;

                log::debug!(
                    "Slave {} ({:#06x}) elected DC reference clock",
                    slave,
                    configured_address
                );
            }

            // All four port receive times in one read
            let (raw, _) = self.fprd::<[u8; 16]>(
                configured_address,
                RegisterAddress::DcTimePort0.into(),
                self.timeouts.pdu3(),
            )?;

            let mut times = [0u32; 4];

            for (port, chunk) in raw.chunks_exact(4).enumerate() {
                times[port] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }

            // 64 bit local time of the processing unit at the latch
            let (local_time, _) = self.fprd::<u64>(
                configured_address,
                RegisterAddress::DcReceiveTime.into(),
                self.timeouts.pdu3(),
            )?;

            let delay = if slave == reference {
                0
            } else {
                let ancestor = self.nearest_dc_ancestor(slave, reference)?;
                let ancestor_rec = self.slave(ancestor)?;

                let half_path = times[0]
                    .wrapping_sub(ancestor_rec.dc_receive_times[0])
                    .wrapping_div(2);

                ancestor_rec.propagation_delay.wrapping_add(half_path)
            };

            {
                let rec = self.slave_mut(slave)?;

                rec.dc_receive_times = times;
                rec.propagation_delay = delay;
            }

            // Offset the slave's clock so it reports host wall time, then
            // program the measured path delay
            let offset = master_time.wrapping_sub(local_time as i64);

            self.fpwr(
                configured_address,
                RegisterAddress::DcSystemTimeOffset.into(),
                offset,
                self.timeouts.pdu3(),
            )?;

            self.fpwr(
                configured_address,
                RegisterAddress::DcSystemTimeTransmissionDelay.into(),
                delay,
                self.timeouts.pdu3(),
            )?;

            log::debug!("Slave {} propagation delay {} ns", slave, delay);
        }

        if reference == 0 {
            self.dc_reference.store(0, Ordering::Relaxed);

            return Ok(false);
        }

        let reference_address = self.slave(reference)?.configured_address();

        self.dc_reference.store(reference_address, Ordering::Relaxed);

        // Flag groups containing DC slaves so the cyclic exchange appends the
        // distribution datagram
        for group in 0..MAX_GROUPS as u8 {
            let has_dc = (1..=count).any(|slave| {
                self.in_group(slave, group)
                    && self.slave(slave).map(|rec| rec.has_dc).unwrap_or(false)
            });

            self.groups[usize::from(group)].has_dc = has_dc;
        }

        // Prime the distribution once so all clocks start from the reference
        let mut time_image = [0u8; 8];

        self.port.frmw(
            reference_address,
            RegisterAddress::DcSystemTime.into(),
            &mut time_image,
            self.timeouts.pdu3(),
        )?;

        Ok(true)
    }

    /// Closest ancestor of `slave` that carries a DC clock, falling back to
    /// the reference slave when the chain reaches the master.
    fn nearest_dc_ancestor(&self, slave: u16, reference: u16) -> Result<u16, Error> {
        let mut current = self.slave(slave)?.parent;

        while current != 0 {
            if self.slave(current)?.has_dc {
                return Ok(current);
            }

            current = self.slave(current)?.parent;
        }

        Ok(reference)
    }

    /// Arm (or disarm) SYNC0 pulse generation on a slave.
    ///
    /// `cycle_shift` shifts the pulse train relative to the cycle boundary,
    /// in nanoseconds.
    pub fn dc_sync0(
        &self,
        slave: u16,
        active: bool,
        cycle_time: Duration,
        cycle_shift: i64,
    ) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();

        // Stop generation while reprogramming
        self.fpwr::<u8>(
            configured_address,
            RegisterAddress::DcSyncActive.into(),
            0,
            self.timeouts.pdu3(),
        )?;

        if !active {
            return Ok(());
        }

        let cycle = cycle_time.as_nanos() as u64;

        let (now, _) = self.fprd::<u64>(
            configured_address,
            RegisterAddress::DcSystemTime.into(),
            self.timeouts.pdu3(),
        )?;

        // First pulse on a whole cycle boundary comfortably in the future
        let start = ((now + SYNC_START_DELAY_NS) / cycle) * cycle + cycle;
        let start = (start as i64 + cycle_shift) as u64;

        self.fpwr(
            configured_address,
            RegisterAddress::DcSyncStartTime.into(),
            start,
            self.timeouts.pdu3(),
        )?;

        self.fpwr(
            configured_address,
            RegisterAddress::DcSync0CycleTime.into(),
            cycle as u32,
            self.timeouts.pdu3(),
        )?;

        // Cyclic generation + SYNC0
        self.fpwr::<u8>(
            configured_address,
            RegisterAddress::DcSyncActive.into(),
            0x03,
            self.timeouts.pdu3(),
        )?;

        Ok(())
    }

    /// Arm (or disarm) SYNC0 and SYNC1 pulse generation on a slave.
    ///
    /// SYNC1 typically runs at a multiple of the SYNC0 cycle.
    pub fn dc_sync01(
        &self,
        slave: u16,
        active: bool,
        cycle_time0: Duration,
        cycle_time1: Duration,
        cycle_shift: i64,
    ) -> Result<(), Error> {
        let configured_address = self.slave(slave)?.configured_address();

        self.fpwr::<u8>(
            configured_address,
            RegisterAddress::DcSyncActive.into(),
            0,
            self.timeouts.pdu3(),
        )?;

        if !active {
            return Ok(());
        }

        let cycle0 = cycle_time0.as_nanos() as u64;
        let cycle1 = cycle_time1.as_nanos() as u64;

        // Align the start so both pulse trains begin on a shared boundary
        let true_cycle = (cycle1 / cycle0 + 1) * cycle0;

        let (now, _) = self.fprd::<u64>(
            configured_address,
            RegisterAddress::DcSystemTime.into(),
            self.timeouts.pdu3(),
        )?;

        let start = ((now + SYNC_START_DELAY_NS) / true_cycle) * true_cycle + true_cycle;
        let start = (start as i64 + cycle_shift) as u64;

        self.fpwr(
            configured_address,
            RegisterAddress::DcSyncStartTime.into(),
            start,
            self.timeouts.pdu3(),
        )?;

        self.fpwr(
            configured_address,
            RegisterAddress::DcSync0CycleTime.into(),
            cycle0 as u32,
            self.timeouts.pdu3(),
        )?;

        self.fpwr(
            configured_address,
            RegisterAddress::DcSync1CycleTime.into(),
            cycle1 as u32,
            self.timeouts.pdu3(),
        )?;

        // Cyclic generation + SYNC0 + SYNC1
        self.fpwr::<u8>(
            configured_address,
            RegisterAddress::DcSyncActive.into(),
            0x07,
            self.timeouts.pdu3(),
        )?;

        Ok(())
    }
}

/// How the PI integral term is fed.
///
/// The two deployed variants of this loop disagree on more than the gains:
/// one steps the accumulator by one per cycle in the direction of the error,
/// the other accumulates the error value itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum IntegralRule {
    /// One step per cycle in the direction of the error.
    SignStep,
    /// The error value itself is accumulated.
    ErrorSum,
}

/// PI controller mapping the host cycle onto DC time.
///
/// Feed the reference clock time captured by each cyclic exchange to
/// [`sample`](Self::sample); the returned adjustment is added to the host
/// sleep interval so the host wakes phase locked to the DC cycle.
///
/// The constants are deliberately configuration: the deployed references
/// disagree on both the gains and the integral rule, so both observed
/// presets are constructors. [`new`](Self::new) is the sign-stepping
/// divide-by-100/20 form; [`soem_default`](Self::soem_default) is the
/// `pgain`/`igain` form that accumulates the raw error.
#[derive(Debug, Clone)]
pub struct SyncController {
    cycle_time: i64,
    shift_time: i64,
    kp: f64,
    ki: f64,
    integral_rule: IntegralRule,
    integral: i64,
    last_error: i64,
}

impl SyncController {
    /// Controller with explicit gains, accumulating the raw error:
    /// `offset = error·kp + integral·ki` with `integral += error`.
    ///
    /// `shift_time` places the host wake point relative to the DC cycle
    /// boundary.
    pub fn with_gains(cycle_time: Duration, shift_time: Duration, kp: f64, ki: f64) -> Self {
        Self {
            cycle_time: cycle_time.as_nanos() as i64,
            shift_time: shift_time.as_nanos() as i64,
            kp,
            ki,
            integral_rule: IntegralRule::ErrorSum,
            integral: 0,
            last_error: 0,
        }
    }

    /// The qualified default: proportional 1/100, integral step 1/20, with
    /// the integral stepped by one per cycle in the error's direction.
    pub fn new(cycle_time: Duration, shift_time: Duration) -> Self {
        Self {
            integral_rule: IntegralRule::SignStep,
            ..Self::with_gains(cycle_time, shift_time, 1.0 / 100.0, 1.0 / 20.0)
        }
    }

    /// The `pgain = 0.01`, `igain = 0.00002` preset, with the raw error
    /// accumulated into the integral term.
    pub fn soem_default(cycle_time: Duration, shift_time: Duration) -> Self {
        Self::with_gains(cycle_time, shift_time, 0.01, 0.00002)
    }

    /// Update the loop with the DC time sampled this cycle and return the
    /// sleep adjustment for the next cycle, in nanoseconds.
    pub fn sample(&mut self, dc_time: i64) -> i64 {
        let mut delta = (dc_time - self.shift_time).rem_euclid(self.cycle_time);

        if delta > self.cycle_time / 2 {
            delta -= self.cycle_time;
        }

        let error = -delta;

        self.integral += match self.integral_rule {
            IntegralRule::SignStep => error.signum(),
            IntegralRule::ErrorSum => error,
        };

        self.last_error = delta;

        (error as f64 * self.kp) as i64 + (self.integral as f64 * self.ki) as i64
    }

    /// Phase error observed at the last [`sample`](Self::sample) call, in
    /// nanoseconds.
    pub fn last_error(&self) -> i64 {
        self.last_error
    }

    /// Reset the integral accumulator, e.g. after a bus restart.
    pub fn reset(&mut self) {
        self.integral = 0;
        self.last_error = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The loop must pull a 100 µs initial phase error under 10 µs within a
    /// second and hold it there.
    #[test]
    fn pi_converges_and_holds() {
        let cycle = Duration::from_micros(1000);
        let mut controller = SyncController::new(cycle, Duration::ZERO);

        // Host phase error in ns; the controller output shifts the host
        // wake point each cycle.
        let mut phase: i64 = 100_000;

        let mut worst_after_lock = 0i64;

        for cycle_no in 0..11_000 {
            let dc_time = cycle_no * 1_000_000 + phase;

            let adjustment = controller.sample(dc_time);

            phase += adjustment;

            if cycle_no == 1000 {
                assert!(
                    controller.last_error().abs() < 10_000,
                    "error still {} ns after 1 s",
                    controller.last_error()
                );
            }

            if cycle_no > 1000 {
                worst_after_lock = worst_after_lock.max(controller.last_error().abs());
            }
        }

        assert!(
            worst_after_lock < 10_000,
            "error peaked at {} ns after lock",
            worst_after_lock
        );
    }

    #[test]
    fn shift_moves_the_lock_point() {
        let cycle = Duration::from_micros(1000);
        let mut controller = SyncController::new(cycle, Duration::from_micros(50));

        // Exactly on the shifted boundary: no correction needed
        let adjustment = controller.sample(5 * 1_000_000 + 50_000);

        assert_eq!(controller.last_error(), 0);
        assert_eq!(adjustment, 0);
    }

    /// The `soem_default` preset accumulates the raw error, so a held phase
    /// error grows the integral term by its full value each cycle.
    #[test]
    fn soem_default_accumulates_raw_error() {
        let cycle = Duration::from_micros(1000);
        let mut controller = SyncController::soem_default(cycle, Duration::ZERO);

        // 100 µs late: p-term -1000 ns, integral -100000 → i-term -2 ns
        assert_eq!(controller.sample(5 * 1_000_000 + 100_000), -1002);
        // Held error: integral doubles while the p-term stays put
        assert_eq!(controller.sample(6 * 1_000_000 + 100_000), -1004);

        // The sign-stepping default only moves its integral one step per
        // cycle under the same input
        let mut stepped = SyncController::new(cycle, Duration::ZERO);

        assert_eq!(stepped.sample(5 * 1_000_000 + 100_000), -1000);
        assert_eq!(stepped.sample(6 * 1_000_000 + 100_000), -1000);
    }
}
