//! Component data model.
//!
//! A component is a remote worker process that registers with the
//! coordinator. This module holds the descriptor types that travel over the
//! wire, the component lifecycle states and roles, and
//! [`RegisteredComponent`], the coordinator-side record that pairs a
//! descriptor with the client used to drive it.

pub mod client;
pub mod mock;
pub mod service;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use client::{
    ComponentClient, FlasherSetting, MonitorSnapshot, RemoteComponent, WiringEntry,
};

/// Unique component identity, assigned at registration and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u32);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Component lifecycle states as reported by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentState {
    Idle,
    Connected,
    Configuring,
    Ready,
    Running,
    Stopping,
    ForcingStop,
    Error,
    Quarantined,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::ForcingStop => "forcingStop",
            Self::Error => "error",
            Self::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a component, derived from its name at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Builder,
    Trigger,
    Other,
}

impl Role {
    /// `...Hub` is a source, `...Builder(s)` a builder, `...Trigger` a trigger.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with("hub") {
            Role::Source
        } else if lower.ends_with("builder") || lower.ends_with("builders") {
            Role::Builder
        } else if lower.ends_with("trigger") {
            Role::Trigger
        } else {
            Role::Other
        }
    }
}

/// Connector direction. Upper-case flags mark optional connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorDirection {
    #[serde(rename = "i")]
    Input,
    #[serde(rename = "o")]
    Output,
    #[serde(rename = "I")]
    OptionalInput,
    #[serde(rename = "O")]
    OptionalOutput,
}

impl ConnectorDirection {
    pub fn from_flag(flag: char) -> Option<Self> {
        match flag {
            'i' => Some(Self::Input),
            'o' => Some(Self::Output),
            'I' => Some(Self::OptionalInput),
            'O' => Some(Self::OptionalOutput),
            _ => None,
        }
    }

    pub fn flag(&self) -> char {
        match self {
            Self::Input => 'i',
            Self::Output => 'o',
            Self::OptionalInput => 'I',
            Self::OptionalOutput => 'O',
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input | Self::OptionalInput)
    }

    pub fn is_output(&self) -> bool {
        !self.is_input()
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Self::OptionalInput | Self::OptionalOutput)
    }
}

/// A typed, directional endpoint on a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    #[serde(rename = "type")]
    pub conn_type: String,
    #[serde(rename = "dir")]
    pub direction: ConnectorDirection,
    /// Listening port; only meaningful for inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Connector {
    pub fn input(conn_type: impl Into<String>, port: u16) -> Self {
        Self {
            conn_type: conn_type.into(),
            direction: ConnectorDirection::Input,
            port: Some(port),
        }
    }

    pub fn optional_input(conn_type: impl Into<String>, port: u16) -> Self {
        Self {
            conn_type: conn_type.into(),
            direction: ConnectorDirection::OptionalInput,
            port: Some(port),
        }
    }

    pub fn output(conn_type: impl Into<String>) -> Self {
        Self {
            conn_type: conn_type.into(),
            direction: ConnectorDirection::Output,
            port: None,
        }
    }

    pub fn optional_output(conn_type: impl Into<String>) -> Self {
        Self {
            conn_type: conn_type.into(),
            direction: ConnectorDirection::OptionalOutput,
            port: None,
        }
    }
}

/// What a worker sends when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRegistration {
    pub name: String,
    #[serde(default)]
    pub num: u32,
    pub host: String,
    pub cmd_port: u16,
    #[serde(default)]
    pub telemetry_port: u16,
    #[serde(default)]
    pub connectors: Vec<Connector>,
}

/// A registered component's fixed description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDescriptor {
    pub id: ComponentId,
    pub name: String,
    pub num: u32,
    pub host: String,
    pub cmd_port: u16,
    pub telemetry_port: u16,
    pub connectors: Vec<Connector>,
    pub role: Role,
}

impl ComponentDescriptor {
    pub fn new(id: ComponentId, registration: ComponentRegistration) -> Self {
        let role = Role::from_name(&registration.name);
        Self {
            id,
            name: registration.name,
            num: registration.num,
            host: registration.host,
            cmd_port: registration.cmd_port,
            telemetry_port: registration.telemetry_port,
            connectors: registration.connectors,
            role,
        }
    }

    /// `name#num`, or just `name` for instance zero.
    pub fn full_name(&self) -> String {
        ComponentSpec::new(&self.name, self.num).to_string()
    }

    pub fn matches(&self, spec: &ComponentSpec) -> bool {
        self.name == spec.name && self.num == spec.num
    }
}

impl fmt::Display for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.full_name(), self.id)
    }
}

/// A requested component, written `name` or `name#num`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentSpec {
    pub name: String,
    pub num: u32,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, num: u32) -> Self {
        Self {
            name: name.into(),
            num,
        }
    }
}

impl fmt::Display for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num == 0 {
            f.write_str(&self.name)
        } else {
            write!(f, "{}#{}", self.name, self.num)
        }
    }
}

impl FromStr for ComponentSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, num) = match s.split_once('#') {
            Some((name, num)) => {
                let num = num
                    .parse::<u32>()
                    .map_err(|_| format!("bad instance number in '{}'", s))?;
                (name, num)
            }
            None => (s, 0),
        };
        if name.is_empty() {
            return Err(format!("empty component name in '{}'", s));
        }
        Ok(Self::new(name, num))
    }
}

impl TryFrom<String> for ComponentSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ComponentSpec> for String {
    fn from(spec: ComponentSpec) -> Self {
        spec.to_string()
    }
}

/// Coordinator-side record of a registered component.
///
/// Owned by the registry while idle and by exactly one run-set while
/// allocated.
pub struct RegisteredComponent {
    descriptor: ComponentDescriptor,
    client: Arc<dyn ComponentClient>,
    state: ComponentState,
    generation: u32,
    order: u32,
}

impl RegisteredComponent {
    pub fn new(descriptor: ComponentDescriptor, client: Arc<dyn ComponentClient>) -> Self {
        Self {
            descriptor,
            client,
            state: ComponentState::Idle,
            generation: 0,
            order: 0,
        }
    }

    pub fn id(&self) -> ComponentId {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    pub fn client(&self) -> Arc<dyn ComponentClient> {
        Arc::clone(&self.client)
    }

    pub fn role(&self) -> Role {
        self.descriptor.role
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Records a successful reset.
    pub fn mark_reset(&mut self) {
        self.state = ComponentState::Idle;
        self.generation += 1;
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn set_order(&mut self, order: u32) {
        self.order = order;
    }

    pub fn snapshot(&self) -> ComponentSnapshot {
        ComponentSnapshot {
            descriptor: self.descriptor.clone(),
            state: self.state,
            generation: self.generation,
            order: self.order,
        }
    }
}

impl fmt::Debug for RegisteredComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredComponent")
            .field("descriptor", &self.descriptor)
            .field("client", &"Arc<dyn ComponentClient>")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("order", &self.order)
            .finish()
    }
}

/// Serializable view of a component for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSnapshot {
    #[serde(flatten)]
    pub descriptor: ComponentDescriptor,
    pub state: ComponentState,
    pub generation: u32,
    pub order: u32,
}
