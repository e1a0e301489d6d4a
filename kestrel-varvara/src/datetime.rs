use chrono::{Datelike, Timelike};
use std::mem::offset_of;
use uxn::{Machine, Ports};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct DatetimePorts {
    year: U16<BigEndian>,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    day_of_week: u8,
    day_of_year: U16<BigEndian>,
    is_dst: u8,
    _pad: [u8; 5],
}

impl Ports for DatetimePorts {
    const BASE: u8 = 0xc0;
}

impl DatetimePorts {
    const YEAR_H: u8 = Self::BASE | offset_of!(Self, year) as u8;
    const YEAR_L: u8 = Self::YEAR_H + 1;
    const MONTH: u8 = Self::BASE | offset_of!(Self, month) as u8;
    const DAY: u8 = Self::BASE | offset_of!(Self, day) as u8;
    const HOUR: u8 = Self::BASE | offset_of!(Self, hour) as u8;
    const MINUTE: u8 = Self::BASE | offset_of!(Self, minute) as u8;
    const SECOND: u8 = Self::BASE | offset_of!(Self, second) as u8;
    const DAY_OF_WEEK: u8 = Self::BASE | offset_of!(Self, day_of_week) as u8;
    const DAY_OF_YEAR_H: u8 = Self::BASE | offset_of!(Self, day_of_year) as u8;
    const DAY_OF_YEAR_L: u8 = Self::DAY_OF_YEAR_H + 1;
    const IS_DST: u8 = Self::BASE | offset_of!(Self, is_dst) as u8;
}

/// The wall clock, polled through reads; it never fires a vector
pub struct Datetime;

impl Datetime {
    pub fn deo(&mut self, _vm: &mut Machine, _target: u8) {
        // The clock cannot be set
    }

    pub fn dei(&mut self, vm: &mut Machine, target: u8) {
        let t = chrono::Local::now();
        let d = vm.dev_mut::<DatetimePorts>();
        match target {
            DatetimePorts::YEAR_H | DatetimePorts::YEAR_L => {
                d.year.set(t.year() as u16);
            }
            // January is 0
            DatetimePorts::MONTH => d.month = t.month0() as u8,
            DatetimePorts::DAY => d.day = t.day() as u8,
            DatetimePorts::HOUR => d.hour = t.hour() as u8,
            DatetimePorts::MINUTE => d.minute = t.minute() as u8,
            DatetimePorts::SECOND => d.second = t.second() as u8,
            // Sunday is 0
            DatetimePorts::DAY_OF_WEEK => {
                d.day_of_week = t.weekday().num_days_from_sunday() as u8;
            }
            // 1 January is 0
            DatetimePorts::DAY_OF_YEAR_H | DatetimePorts::DAY_OF_YEAR_L => {
                d.day_of_year.set(t.ordinal0() as u16);
            }
            DatetimePorts::IS_DST => {
                // TODO: chrono exposes no DST query for the local zone
                d.is_dst = 0;
            }
            _ => (),
        }
    }
}
