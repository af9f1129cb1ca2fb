//! The two record schemas carried by the log fabric.
//!
//! Text records, for humans:
//!
//! ```text
//! 2026-10-19 13:04:05.123456 [INFO] Starting run 1234
//! ```
//!
//! Monitor records, for the live monitoring service:
//!
//! ```text
//! daqcnc(runstart:json) 1 [2026-10-19 13:04:05] {"run":1234}
//! ```

use chrono::{Local, NaiveDateTime};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const TEXT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const MONI_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown level '{}'", other)),
        }
    }
}

/// Delivery priority of a monitor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Forwarded to the experiment control system.
    Its = 1,
    /// Summaries that end up in operator mail.
    Email = 2,
    /// Bulk data shipped in batches.
    Scp = 3,
    Debug = 4,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Payload type tag of a monitor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoniType {
    Str,
    Int,
    Float,
    Json,
}

impl MoniType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoniType::Str => "str",
            MoniType::Int => "int",
            MoniType::Float => "float",
            MoniType::Json => "json",
        }
    }
}

impl FromStr for MoniType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "str" => Ok(MoniType::Str),
            "int" => Ok(MoniType::Int),
            "float" => Ok(MoniType::Float),
            "json" => Ok(MoniType::Json),
            other => Err(format!("unknown monitor type '{}'", other)),
        }
    }
}

/// Encodes a value the way the monitor schema expects: numbers and strings
/// raw, everything else tagged as json.
pub fn encode_value(value: &Value) -> (MoniType, String) {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => (MoniType::Int, n.to_string()),
        Value::Number(n) => (MoniType::Float, n.to_string()),
        Value::String(s) => (MoniType::Str, s.clone()),
        other => (MoniType::Json, other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Text {
        timestamp: NaiveDateTime,
        level: LogLevel,
        message: String,
    },
    Monitor {
        service: String,
        var: String,
        kind: MoniType,
        priority: u8,
        timestamp: NaiveDateTime,
        payload: String,
    },
}

impl LogRecord {
    pub fn text(level: LogLevel, message: impl Into<String>) -> Self {
        LogRecord::Text {
            timestamp: Local::now().naive_local(),
            level,
            message: message.into(),
        }
    }

    pub fn monitor(service: &str, var: &str, value: &Value, priority: Priority) -> Self {
        let (kind, payload) = encode_value(value);
        LogRecord::Monitor {
            service: service.to_string(),
            var: var.to_string(),
            kind,
            priority: priority.value(),
            timestamp: Local::now().naive_local(),
            payload,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, LogRecord::Text { .. })
    }

    /// The human-readable part: the message of a text record or the
    /// payload of a monitor record.
    pub fn body(&self) -> &str {
        match self {
            LogRecord::Text { message, .. } => message,
            LogRecord::Monitor { payload, .. } => payload,
        }
    }

    pub fn var(&self) -> Option<&str> {
        match self {
            LogRecord::Monitor { var, .. } => Some(var),
            LogRecord::Text { .. } => None,
        }
    }

    /// Decodes the payload of a json monitor record.
    pub fn json(&self) -> Option<Value> {
        match self {
            LogRecord::Monitor {
                kind: MoniType::Json,
                payload,
                ..
            } => serde_json::from_str(payload).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Text {
                timestamp,
                level,
                message,
            } => write!(
                f,
                "{} [{}] {}",
                timestamp.format(TEXT_TIME_FORMAT),
                level,
                message
            ),
            LogRecord::Monitor {
                service,
                var,
                kind,
                priority,
                timestamp,
                payload,
            } => write!(
                f,
                "{}({}:{}) {} [{}] {}",
                service,
                var,
                kind.as_str(),
                priority,
                timestamp.format(MONI_TIME_FORMAT),
                payload
            ),
        }
    }
}

impl FromStr for LogRecord {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (head, _) = line
            .split_once(' ')
            .ok_or_else(|| format!("malformed record '{}'", line))?;
        if head.ends_with(')') && head.contains('(') {
            parse_monitor(line)
        } else {
            parse_text(line)
        }
    }
}

fn parse_time(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, TEXT_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, MONI_TIME_FORMAT))
        .map_err(|e| format!("bad timestamp '{}': {}", s, e))
}

fn parse_text(line: &str) -> Result<LogRecord, String> {
    let open = line
        .find(" [")
        .ok_or_else(|| format!("missing level in '{}'", line))?;
    let timestamp = parse_time(&line[..open])?;
    let rest = &line[open + 2..];
    let (level, message) = rest
        .split_once("] ")
        .or_else(|| rest.strip_suffix(']').map(|level| (level, "")))
        .ok_or_else(|| format!("unterminated level in '{}'", line))?;
    Ok(LogRecord::Text {
        timestamp,
        level: level.parse()?,
        message: message.to_string(),
    })
}

fn parse_monitor(line: &str) -> Result<LogRecord, String> {
    let (head, rest) = line
        .split_once(' ')
        .ok_or_else(|| format!("malformed record '{}'", line))?;
    let (service, tag) = head
        .trim_end_matches(')')
        .split_once('(')
        .ok_or_else(|| format!("malformed header '{}'", head))?;
    let (var, kind) = tag
        .rsplit_once(':')
        .ok_or_else(|| format!("missing type in '{}'", head))?;

    let (priority, rest) = rest
        .split_once(' ')
        .ok_or_else(|| format!("missing priority in '{}'", line))?;
    let priority = priority
        .parse::<u8>()
        .map_err(|e| format!("bad priority '{}': {}", priority, e))?;

    let rest = rest
        .strip_prefix('[')
        .ok_or_else(|| format!("missing timestamp in '{}'", line))?;
    let (timestamp, payload) = rest
        .split_once("] ")
        .or_else(|| rest.strip_suffix(']').map(|ts| (ts, "")))
        .ok_or_else(|| format!("unterminated timestamp in '{}'", line))?;

    Ok(LogRecord::Monitor {
        service: service.to_string(),
        var: var.to_string(),
        kind: kind.parse()?,
        priority,
        timestamp: parse_time(timestamp)?,
        payload: payload.to_string(),
    })
}
