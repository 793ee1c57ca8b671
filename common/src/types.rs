use std::{fmt, net::Ipv4Addr, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ticks::Ticks;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub taken_at: Ticks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorState {
    pub on: bool,
}

impl ActuatorState {
    pub const OFF: Self = Self { on: false };
    pub const ON: Self = Self { on: true };

    /// `1` switches on and any other whole number switches off. Fractional
    /// values are not commands.
    pub fn from_command(value: f32) -> Option<Self> {
        if !value.is_finite() || value.fract() != 0.0 {
            return None;
        }
        Some(Self { on: value == 1.0 })
    }

    pub fn as_field_value(self) -> f32 {
        if self.on {
            1.0
        } else {
            0.0
        }
    }

    pub fn as_str(self) -> &'static str {
        if self.on {
            "ON"
        } else {
            "OFF"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Field(u8);

impl Field {
    pub const MAX: u8 = 8;

    pub const fn new(index: u8) -> Self {
        assert!(index >= 1 && index <= Self::MAX, "field index out of range");
        Self(index)
    }

    pub fn try_new(index: u8) -> Option<Self> {
        (1..=Self::MAX).contains(&index).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn key(self) -> String {
        format!("field{}", self.0)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub value: f32,
    pub entry_id: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl FieldValue {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            entry_id: None,
            created_at: None,
        }
    }
}

/// Field values for one update request. Setting a field twice keeps the last value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelUpdate {
    values: Vec<(Field, f32)>,
}

impl ChannelUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: Field, value: f32) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: Field, value: f32) {
        match self.values.iter_mut().find(|(existing, _)| *existing == field) {
            Some(slot) => slot.1 = value,
            None => self.values.push((field, value)),
        }
    }

    pub fn get(&self, field: Field) -> Option<f32> {
        self.values
            .iter()
            .find(|(existing, _)| *existing == field)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, f32)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub entry_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub ip: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

impl LinkInfo {
    pub fn with_ip(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            gateway: None,
            netmask: None,
            dns: None,
        }
    }
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip={}", self.ip)?;
        if let Some(netmask) = self.netmask {
            write!(f, " netmask={netmask}")?;
        }
        if let Some(gateway) = self.gateway {
            write!(f, " gateway={gateway}")?;
        }
        if let Some(dns) = self.dns {
            write!(f, " dns={dns}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopVariant {
    #[default]
    RemoteCommand,
    Heartbeat,
}

impl LoopVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteCommand => "remote_command",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for LoopVariant {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "remote_command" => Ok(Self::RemoteCommand),
            "heartbeat" => Ok(Self::Heartbeat),
            other => Err(format!("unknown loop variant `{other}`")),
        }
    }
}
