//! High Precision Event Timer
//!
//! The HPET provides a free running main counter with a fixed period (reported in femtoseconds) and a number of
//! comparators which can raise interrupts, optionally periodically.
//! It is the kernel's source of both time measurement and the scheduling tick.

use bitflags::bitflags;
use core::ptr::{addr_of, addr_of_mut};
use static_assertions::const_assert_eq;

const FEMTOSECONDS_PER_MICROSECOND: u64 = 1_000_000_000;

#[repr(C)]
pub struct TimerRegisters {
    configuration: u64,
    comparator: u64,
    fsb_route: u64,
    _reserved: u64,
}

/// The memory mapped register block of an HPET
#[repr(C)]
pub struct HpetRegisters {
    capabilities: u64,
    _reserved0: u64,
    configuration: u64,
    _reserved1: u64,
    interrupt_status: u64,
    _reserved2: [u64; 25],
    main_counter: u64,
    _reserved3: u64,
    timers: [TimerRegisters; 32],
}

const_assert_eq!(core::mem::offset_of!(HpetRegisters, configuration), 0x10);
const_assert_eq!(core::mem::offset_of!(HpetRegisters, main_counter), 0xF0);
const_assert_eq!(core::mem::offset_of!(HpetRegisters, timers), 0x100);

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct GeneralConfig: u64 {
        const ENABLE = 1 << 0;
        /// Timer 0 interrupts on IRQ0 and timer 1 on IRQ8
        const LEGACY_REPLACEMENT = 1 << 1;
    }

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct TimerConfig: u64 {
        const LEVEL_TRIGGERED = 1 << 1;
        const INTERRUPT_ENABLE = 1 << 2;
        const PERIODIC = 1 << 3;
        const PERIODIC_CAPABLE = 1 << 4;
        /// The next comparator write sets the accumulator of a periodic timer
        const SET_VALUE = 1 << 6;
    }
}

pub struct Hpet {
    regs: *mut HpetRegisters,
}

impl Hpet {
    /// # Safety
    /// `regs` must point to the mapped register block of an HPET that nothing else accesses.
    pub unsafe fn new(regs: *mut HpetRegisters) -> Self {
        Self { regs }
    }

    pub fn femtoseconds_per_tick(&self) -> u64 {
        unsafe { addr_of!((*self.regs).capabilities).read_volatile() >> 32 }
    }

    pub fn timer_count(&self) -> usize {
        let caps = unsafe { addr_of!((*self.regs).capabilities).read_volatile() };
        ((caps >> 8) & 0x1f) as usize + 1
    }

    pub fn main_counter(&self) -> u64 {
        unsafe { addr_of!((*self.regs).main_counter).read_volatile() }
    }

    pub fn ticks_to_femtoseconds(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.femtoseconds_per_tick())
    }

    /// Femtoseconds elapsed since the main counter read `start`
    pub fn femtoseconds_since(&self, start: u64) -> u64 {
        self.ticks_to_femtoseconds(self.main_counter().wrapping_sub(start))
    }

    /// Reset the main counter and start counting, routing timers the legacy way
    pub fn enable(&mut self) {
        unsafe {
            let config = addr_of_mut!((*self.regs).configuration);
            let flags = GeneralConfig::from_bits_retain(config.read_volatile());
            config.write_volatile((flags - GeneralConfig::ENABLE).bits());
            addr_of_mut!((*self.regs).main_counter).write_volatile(0);
            config.write_volatile(
                (flags | GeneralConfig::ENABLE | GeneralConfig::LEGACY_REPLACEMENT).bits(),
            );
        }
        log::debug!(
            "hpet enabled, {} fs per tick, {} timers",
            self.femtoseconds_per_tick(),
            self.timer_count()
        );
    }

    /// Make timer `index` raise its interrupt every `interval_us` microseconds
    pub fn set_periodic_timer(&mut self, index: usize, interval_us: u64) {
        assert!(index < self.timer_count(), "hpet has no timer {index}");
        let ticks = interval_us * FEMTOSECONDS_PER_MICROSECOND / self.femtoseconds_per_tick();
        unsafe {
            let timer = addr_of_mut!((*self.regs).timers[index]);
            let config = addr_of_mut!((*timer).configuration);
            let mut flags = TimerConfig::from_bits_retain(config.read_volatile());
            if !flags.contains(TimerConfig::PERIODIC_CAPABLE) {
                log::warn!("hpet timer {index} doesn't advertise periodic mode");
            }
            flags -= TimerConfig::LEVEL_TRIGGERED;
            flags |= TimerConfig::INTERRUPT_ENABLE | TimerConfig::PERIODIC | TimerConfig::SET_VALUE;
            config.write_volatile(flags.bits());
            addr_of_mut!((*timer).comparator).write_volatile(ticks);
        }
        log::debug!("hpet timer {index} fires every {interval_us}us ({ticks} ticks)");
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    fn fake_registers(period_fs: u64) -> Box<HpetRegisters> {
        let mut regs: Box<HpetRegisters> = unsafe { Box::new(core::mem::zeroed()) };
        // 3 timers
        regs.capabilities = (period_fs << 32) | (2 << 8);
        regs.timers[0].configuration = TimerConfig::PERIODIC_CAPABLE.bits();
        regs.main_counter = 1234;
        regs
    }

    #[test]
    fn enabling_resets_counter_and_sets_flags() {
        let mut regs = fake_registers(10_000_000);
        let mut hpet = unsafe { Hpet::new(&mut *regs) };
        hpet.enable();
        assert_eq!(hpet.main_counter(), 0);
        assert_eq!(hpet.timer_count(), 3);
        assert_eq!(regs.configuration, 0b11);
    }

    #[test]
    fn periodic_timer_is_programmed_in_ticks() {
        let mut regs = fake_registers(10_000_000);
        let mut hpet = unsafe { Hpet::new(&mut *regs) };
        hpet.set_periodic_timer(0, 100);
        let config = TimerConfig::from_bits_retain(regs.timers[0].configuration);
        assert!(config.contains(TimerConfig::PERIODIC | TimerConfig::INTERRUPT_ENABLE));
        // 100us at 10ns per tick
        assert_eq!(regs.timers[0].comparator, 10_000);
    }

    #[test]
    fn elapsed_time_is_reported_in_femtoseconds() {
        let mut regs = fake_registers(69_841_279);
        let hpet = unsafe { Hpet::new(&mut *regs) };
        assert_eq!(hpet.femtoseconds_since(1200), 34 * 69_841_279);
    }
}
