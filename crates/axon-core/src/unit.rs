/// Optional physical unit attached to data ports and wire numbers.
///
/// The discriminants are the stable wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Unit {
    #[default]
    None = 0,
    Meter = 1,
    MeterPerSecond = 2,
    Radian = 3,
    Degree = 4,
    Second = 5,
    Millisecond = 6,
    Hertz = 7,
}

impl Unit {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Unit> {
        Some(match id {
            0 => Unit::None,
            1 => Unit::Meter,
            2 => Unit::MeterPerSecond,
            3 => Unit::Radian,
            4 => Unit::Degree,
            5 => Unit::Second,
            6 => Unit::Millisecond,
            7 => Unit::Hertz,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Meter => "m",
            Unit::MeterPerSecond => "m/s",
            Unit::Radian => "rad",
            Unit::Degree => "deg",
            Unit::Second => "s",
            Unit::Millisecond => "ms",
            Unit::Hertz => "Hz",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_round_trip() {
        for id in 0..=7u8 {
            assert_eq!(Unit::from_id(id).unwrap().id(), id);
        }
        assert!(Unit::from_id(200).is_none());
    }
}
