//! Policy value expressions
//!
//! Rule operands are parsed once, when configuration is loaded, into a
//! [`PolicyValue`] tree. Evaluation resolves the tree against a
//! [`PolicyContext`] into a plain [`Value`].

use std::cmp::Ordering;
use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_json::Value as JsonValue;

/// Fields of local time addressable as `tm_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Year,
    /// 1..=12
    Month,
    /// 1..=31
    MonthDay,
    Hour,
    Minute,
    Second,
    /// 0 = Monday
    WeekDay,
    /// 1..=366
    YearDay,
}

impl TimeField {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "tm_year" => Self::Year,
            "tm_mon" => Self::Month,
            "tm_mday" => Self::MonthDay,
            "tm_hour" => Self::Hour,
            "tm_min" => Self::Minute,
            "tm_sec" => Self::Second,
            "tm_wday" => Self::WeekDay,
            "tm_yday" => Self::YearDay,
            _ => return None,
        })
    }

    pub fn extract(self, t: &NaiveDateTime) -> f64 {
        let v = match self {
            Self::Year => t.year() as u32,
            Self::Month => t.month(),
            Self::MonthDay => t.day(),
            Self::Hour => t.hour(),
            Self::Minute => t.minute(),
            Self::Second => t.second(),
            Self::WeekDay => t.weekday().num_days_from_monday(),
            Self::YearDay => t.ordinal(),
        };
        f64::from(v)
    }
}

/// Functions a rule may call by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFunction {
    /// `checkScheduledCharging()`: 1 inside the scheduled window, else 0
    CheckScheduledCharging,
    /// `getMaxAmpsToDivideGreenEnergy()`: budget derived from solar surplus
    GreenEnergyAmps,
}

/// A parsed rule operand
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyValue {
    Literal(Value),
    Now,
    TimeField(TimeField),
    Setting(String),
    Config(String),
    Module { module: String, attr: String },
    Call(PolicyFunction),
    List(Vec<PolicyValue>),
}

impl PolicyValue {
    /// Interpret a configuration operand
    pub fn parse(raw: &JsonValue) -> Self {
        match raw {
            JsonValue::String(s) => Self::parse_str(s),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::parse).collect()),
            other => Self::Literal(Value::from_json(other)),
        }
    }

    fn parse_str(s: &str) -> Self {
        if s == "now" {
            return Self::Now;
        }
        if let Some(field) = TimeField::parse(s) {
            return Self::TimeField(field);
        }
        match s {
            "checkScheduledCharging()" => return Self::Call(PolicyFunction::CheckScheduledCharging),
            "getMaxAmpsToDivideGreenEnergy()" => return Self::Call(PolicyFunction::GreenEnergyAmps),
            _ => {},
        }
        let pieces: Vec<&str> = s.split('.').collect();
        match pieces.as_slice() {
            ["settings", name, ..] => Self::Setting((*name).to_string()),
            ["config", name, ..] => Self::Config((*name).to_string()),
            ["modules", module, attr, ..] => Self::Module {
                module: (*module).to_string(),
                attr: (*attr).to_string(),
            },
            _ => Self::Literal(Value::Text(s.to_string())),
        }
    }

    pub fn resolve<C: PolicyContext + ?Sized>(&self, ctx: &C) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Now => Value::Number(ctx.now()),
            Self::TimeField(field) => Value::Number(field.extract(&ctx.local_time())),
            Self::Setting(name) => ctx.setting(name).unwrap_or(Value::Number(0.0)),
            Self::Config(name) => ctx.config(name).unwrap_or(Value::Number(0.0)),
            Self::Module { module, attr } => ctx
                .module_attr(module, attr)
                .unwrap_or_else(|| Value::Text(format!("modules.{}.{}", module, attr))),
            Self::Call(function) => ctx.call(*function),
            Self::List(items) => Value::List(items.iter().map(|v| v.resolve(ctx)).collect()),
        }
    }
}

/// A resolved operand
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn from_json(raw: &JsonValue) -> Self {
        match raw {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(_) => Self::Text(raw.to_string()),
        }
    }

    /// Numeric view; booleans count as 0/1
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Ordering between comparable values
    ///
    /// Numbers (and booleans) compare numerically and text compares
    /// lexically. Anything else is unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            },
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            },
        }
    }
}

/// Everything a rule may look at while it is evaluated
pub trait PolicyContext {
    /// Current epoch seconds
    fn now(&self) -> f64;

    /// Current local wall-clock time
    fn local_time(&self) -> NaiveDateTime;

    /// A persisted setting by key, `None` if unset
    fn setting(&self, name: &str) -> Option<Value>;

    /// A core configuration value by key, `None` if unset
    fn config(&self, name: &str) -> Option<Value>;

    /// An attribute published by a named collaborator module
    fn module_attr(&self, _module: &str, _attr: &str) -> Option<Value> {
        None
    }

    fn call(&self, function: PolicyFunction) -> Value;

    /// Vehicle API's lowest battery level among cars at home
    fn min_battery_level_at_home(&self) -> f64 {
        100.0
    }
}
