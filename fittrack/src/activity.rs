use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// An error decoding the raw value of the activity characteristic.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("Activity characteristic value was empty")]
    Empty,
}

/// The activity which a FitTrack tracker has detected.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ActivityCode {
    /// No activity, or an activity the tracker doesn't know about.
    #[default]
    None,
    Rowing,
    Running,
}

impl ActivityCode {
    /// Decode the activity from the raw bytes of the Bluetooth characteristic value.
    ///
    /// Only the first byte is significant. Unknown values decode to `ActivityCode::None` rather than
    /// failing; the only error is a value with no bytes at all.
    pub fn decode(value: &[u8]) -> Result<ActivityCode, DecodeError> {
        match value.first() {
            None => Err(DecodeError::Empty),
            Some(&byte) => Ok(ActivityCode::from(byte)),
        }
    }

    /// Returns the name used for this activity in telemetry, one of `"None"`, `"Rowing"` or
    /// `"Running"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Rowing => "Rowing",
            Self::Running => "Running",
        }
    }
}

impl From<u8> for ActivityCode {
    fn from(byte: u8) -> Self {
        match byte {
            0x01 => Self::Rowing,
            0x02 => Self::Running,
            _ => Self::None,
        }
    }
}

impl From<ActivityCode> for u8 {
    fn from(code: ActivityCode) -> Self {
        match code {
            ActivityCode::None => 0x00,
            ActivityCode::Rowing => 0x01,
            ActivityCode::Running => 0x02,
        }
    }
}

impl Display for ActivityCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an `ActivityCode` from a string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("Invalid activity name {0:?}")]
pub struct ParseActivityError(String);

impl FromStr for ActivityCode {
    type Err = ParseActivityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "Rowing" => Ok(Self::Rowing),
            "Running" => Ok(Self::Running),
            _ => Err(ParseActivityError(s.to_owned())),
        }
    }
}

impl Serialize for ActivityCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActivityCode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}
