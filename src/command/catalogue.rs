//! Declarations of every command the pumps understand.

use crate::frame::Shape;

/// An enum argument value: the wire code plus the names callers may use.
#[derive(Debug)]
pub struct Choice {
    pub code: &'static str,
    pub names: &'static [&'static str],
}

#[derive(Debug)]
pub enum ArgKind {
    /// Fixed-point decimal.
    Quantity {
        min: f64,
        max: f64,
        min_exclusive: bool,
    },
    Integer {
        min: i64,
        max: i64,
    },
    Choice(&'static [Choice]),
    /// Sent as `1` or `0`.
    Flag,
}

#[derive(Debug)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
}

/// What a command returns once interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    None,
    Status,
    Text,
    Number,
    Integer,
    Flag,
    Rate,
    Volume,
    Direction,
    Function,
    Trigger,
    ComMode,
    Dispensed,
}

impl ReplyKind {
    /// Shape of the data field the codec must see.
    pub fn shape(self) -> Shape {
        match self {
            ReplyKind::None | ReplyKind::Status => Shape::None,
            ReplyKind::Number | ReplyKind::Integer | ReplyKind::Flag | ReplyKind::ComMode => {
                Shape::Numeric
            }
            ReplyKind::Text
            | ReplyKind::Rate
            | ReplyKind::Volume
            | ReplyKind::Direction
            | ReplyKind::Function
            | ReplyKind::Trigger
            | ReplyKind::Dispensed => Shape::Text,
        }
    }
}

#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub mnemonic: &'static str,
    /// Fixed text sent ahead of the arguments.
    pub prefix: &'static str,
    /// Arguments in wire order.
    pub args: &'static [ArgSpec],
    pub reply: ReplyKind,
}

pub const DIAMETER_MM: ArgKind = ArgKind::Quantity {
    min: 0.1,
    max: 50.0,
    min_exclusive: false,
};

pub const RATE_VALUE: ArgKind = ArgKind::Quantity {
    min: 0.0,
    max: 9999.0,
    min_exclusive: true,
};

pub const VOLUME_VALUE: ArgKind = ArgKind::Quantity {
    min: 0.0,
    max: 9999.0,
    min_exclusive: false,
};

pub static RATE_VOLUME_UNITS: &[Choice] = &[
    Choice {
        code: "U",
        names: &["\u{3bc}l", "ul", "uL", "microliter"],
    },
    Choice {
        code: "M",
        names: &["ml", "mL", "milliliter", "cc"],
    },
];

pub static VOLUME_UNITS: &[Choice] = &[
    Choice {
        code: "UL",
        names: &["\u{3bc}l", "ul", "uL", "microliter"],
    },
    Choice {
        code: "ML",
        names: &["ml", "mL", "milliliter", "cc"],
    },
];

pub static TIME_UNITS: &[Choice] = &[
    Choice {
        code: "M",
        names: &["min", "mn", "minute"],
    },
    Choice {
        code: "H",
        names: &["h", "hr", "hour"],
    },
];

pub static DIRECTIONS: &[Choice] = &[
    Choice {
        code: "INF",
        names: &["infuse"],
    },
    Choice {
        code: "WDR",
        names: &["withdraw"],
    },
    Choice {
        code: "REV",
        names: &["reverse"],
    },
];

pub static CLEAR_DIRECTIONS: &[Choice] = &[
    Choice {
        code: "INF",
        names: &["infuse", "infused"],
    },
    Choice {
        code: "WDR",
        names: &["withdraw", "withdrawn"],
    },
];

pub static TRIGGERS: &[Choice] = &[
    Choice {
        code: "FT",
        names: &["foot switch", "foot"],
    },
    Choice {
        code: "LE",
        names: &["level control", "level"],
    },
    Choice {
        code: "ST",
        names: &["start only", "start"],
    },
];

pub static FUNCTIONS: &[Choice] = &[
    Choice {
        code: "RAT",
        names: &["rate"],
    },
    Choice {
        code: "INC",
        names: &["increment"],
    },
    Choice {
        code: "DEC",
        names: &["decrement"],
    },
    Choice {
        code: "STP",
        names: &["stop"],
    },
    Choice {
        code: "JMP",
        names: &["jump"],
    },
    Choice {
        code: "LOP",
        names: &["loop for", "loop to"],
    },
    Choice {
        code: "LPS",
        names: &["loop start"],
    },
    Choice {
        code: "LPE",
        names: &["loop end"],
    },
    Choice {
        code: "PAS",
        names: &["pause"],
    },
    Choice {
        code: "IF",
        names: &["if"],
    },
    Choice {
        code: "EVN",
        names: &["event trap"],
    },
    Choice {
        code: "EVR",
        names: &["event reset"],
    },
    Choice {
        code: "BEP",
        names: &["beep"],
    },
    Choice {
        code: "OUT",
        names: &["output"],
    },
];

/// Input pins of the TTL connector that can be queried.
pub static INPUT_PINS: &[i64] = &[2, 3, 4, 6];

macro_rules! arg {
    ($name:literal, $kind:expr) => {
        ArgSpec {
            name: $name,
            kind: $kind,
            required: true,
        }
    };
    ($name:literal, $kind:expr, optional) => {
        ArgSpec {
            name: $name,
            kind: $kind,
            required: false,
        }
    };
}

macro_rules! command {
    ($name:literal, $mnemonic:literal => $reply:ident) => {
        CommandSpec {
            name: $name,
            mnemonic: $mnemonic,
            prefix: "",
            args: &[],
            reply: ReplyKind::$reply,
        }
    };
    ($name:literal, $mnemonic:literal, [$($arg:expr),+ $(,)?]) => {
        CommandSpec {
            name: $name,
            mnemonic: $mnemonic,
            prefix: "",
            args: &[$($arg),+],
            reply: ReplyKind::None,
        }
    };
}

pub static CATALOGUE: &[CommandSpec] = &[
    command!("status", "" => Status),
    command!("firmware_version", "VER" => Text),
    command!("start", "RUN" => None),
    command!("stop", "STP" => None),
    command!("pause", "STP" => None),
    command!("get_diameter", "DIA" => Number),
    command!("set_diameter", "DIA", [arg!("diameter", DIAMETER_MM)]),
    command!("get_rate", "RAT" => Rate),
    command!(
        "set_rate",
        "RAT",
        [
            arg!("value", RATE_VALUE),
            arg!("volume_unit", ArgKind::Choice(RATE_VOLUME_UNITS), optional),
            arg!("time_unit", ArgKind::Choice(TIME_UNITS), optional),
        ]
    ),
    command!("get_volume", "VOL" => Volume),
    command!("set_volume", "VOL", [arg!("value", VOLUME_VALUE)]),
    command!(
        "set_volume_unit",
        "VOL",
        [arg!("unit", ArgKind::Choice(VOLUME_UNITS))]
    ),
    command!("get_direction", "DIR" => Direction),
    command!(
        "set_direction",
        "DIR",
        [arg!("direction", ArgKind::Choice(DIRECTIONS))]
    ),
    command!("get_phase", "PHN" => Integer),
    command!(
        "set_phase",
        "PHN",
        [arg!("phase", ArgKind::Integer { min: 1, max: 41 })]
    ),
    command!("get_function", "FUN" => Function),
    command!(
        "set_function",
        "FUN",
        [
            arg!("function", ArgKind::Choice(FUNCTIONS)),
            arg!("data", ArgKind::Integer { min: 0, max: 99 }, optional),
        ]
    ),
    command!("get_com_mode", "SAF" => ComMode),
    command!(
        "set_com_mode",
        "SAF",
        [arg!("timeout", ArgKind::Integer { min: 0, max: 255 })]
    ),
    command!("get_alarm_buzzer", "AL" => Flag),
    command!("set_alarm_buzzer", "AL", [arg!("enabled", ArgKind::Flag)]),
    command!("get_power_fail", "PF" => Flag),
    command!("set_power_fail", "PF", [arg!("enabled", ArgKind::Flag)]),
    command!("get_trigger", "TRG" => Trigger),
    command!(
        "set_trigger",
        "TRG",
        [arg!("trigger", ArgKind::Choice(TRIGGERS))]
    ),
    command!("get_key_beep", "BP" => Flag),
    command!("set_key_beep", "BP", [arg!("enabled", ArgKind::Flag)]),
    command!("get_buzzer", "BUZ" => Flag),
    command!(
        "set_buzzer",
        "BUZ",
        [
            arg!("on", ArgKind::Flag),
            arg!("count", ArgKind::Integer { min: 0, max: 99 }, optional),
        ]
    ),
    command!("dispensed", "DIS" => Dispensed),
    command!(
        "clear_dispensed",
        "CLD",
        [arg!("direction", ArgKind::Choice(CLEAR_DIRECTIONS))]
    ),
    // Only pin 5 is user programmable.
    CommandSpec {
        name: "ttl_output",
        mnemonic: "OUT",
        prefix: "5",
        args: &[arg!("level", ArgKind::Integer { min: 0, max: 1 })],
        reply: ReplyKind::None,
    },
    CommandSpec {
        name: "ttl_input",
        mnemonic: "IN",
        prefix: "",
        args: &[arg!("pin", ArgKind::Integer { min: 2, max: 6 })],
        reply: ReplyKind::Flag,
    },
];

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    CATALOGUE.iter().find(|spec| spec.name == name)
}

/// Finds the command whose mnemonic is the longest prefix of a request body.
pub fn lookup_mnemonic(body: &str) -> Option<&'static CommandSpec> {
    CATALOGUE
        .iter()
        .filter(|spec| body.starts_with(spec.mnemonic))
        .max_by_key(|spec| spec.mnemonic.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        for (i, spec) in CATALOGUE.iter().enumerate() {
            assert!(
                CATALOGUE[i + 1..].iter().all(|other| other.name != spec.name),
                "duplicate command {}",
                spec.name
            );
        }
    }

    #[test]
    fn mnemonic_lookup_prefers_longest() {
        assert_eq!(lookup_mnemonic("VER").unwrap().mnemonic, "VER");
        assert_eq!(lookup_mnemonic("RAT5.5MH").unwrap().mnemonic, "RAT");
        assert_eq!(lookup_mnemonic("").unwrap().name, "status");
    }

    #[test]
    fn getters_expect_data_setters_do_not() {
        assert_eq!(lookup("get_diameter").unwrap().reply.shape(), Shape::Numeric);
        assert_eq!(lookup("get_rate").unwrap().reply.shape(), Shape::Text);
        assert_eq!(lookup("set_rate").unwrap().reply.shape(), Shape::None);
        assert!(lookup("teleport").is_none());
    }
}
