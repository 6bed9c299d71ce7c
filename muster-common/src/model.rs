// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum_macros::{EnumIter, FromRepr};

#[macro_export]
macro_rules! newtype_uuid {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new_v4() -> $name {
                $name(uuid::Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid =
                    uuid::Uuid::parse_str(s).map_err(|err| format!("Invalid {}: {err}", stringify!($name)))?;
                Ok($name(uuid))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = String;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

newtype_uuid!(CommandId);
newtype_uuid!(DistributionId);
newtype_uuid!(BlobId);
newtype_uuid!(RequestId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Server,
    Client,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Server => write!(f, "server"),
            NodeRole::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Server,
    Client,
    Observer,
}

impl Display for UserRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Server => write!(f, "server"),
            UserRole::Client => write!(f, "client"),
            UserRole::Observer => write!(f, "observer"),
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(UserRole::Server),
            "client" => Ok(UserRole::Client),
            "observer" => Ok(UserRole::Observer),
            _ => Err(format!("Invalid user role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// A scalar attached to a node record (client scores and similar derived
/// values live here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// One member of the topology. Only the server mutates nodes; workers see
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub flags: BTreeSet<String>,
    pub data: BTreeMap<String, ScalarValue>,
    pub last_active: DateTime<Utc>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            role,
            status: NodeStatus::Offline,
            flags: BTreeSet::new(),
            data: BTreeMap::new(),
            last_active: Utc::now(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

/// Per-command state in a distribution table. The discriminants are the wire
/// values of status updates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, FromRepr, Serialize, Deserialize,
)]
#[repr(i32)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Excluded = 1,
    Unrequested = 2,
    Send = 3,
    Started = 4,
    WaitForResponse = 5,
    Finished = 6,
    Failed = 7,
}

impl CommandStatus {
    /// Terminal states count towards a distribution's finish condition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Finished | CommandStatus::Failed | CommandStatus::Excluded
        )
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl TryFrom<i32> for CommandStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        CommandStatus::from_repr(value).ok_or_else(|| format!("Invalid command status: {value}"))
    }
}

impl Display for CommandStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Excluded => write!(f, "EXCLUDED"),
            CommandStatus::Unrequested => write!(f, "UNREQUESTED"),
            CommandStatus::Send => write!(f, "SEND"),
            CommandStatus::Started => write!(f, "STARTED"),
            CommandStatus::WaitForResponse => write!(f, "WAIT_FOR_RESPONSE"),
            CommandStatus::Finished => write!(f, "FINISHED"),
            CommandStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Well known resource registry keys.
pub mod keys {
    pub const WATCHER: &str = "__watcher__";
    pub const STORAGE: &str = "__storage__";
    pub const CHECKPOINTS: &str = "__checkpoints__";
    pub const CLIENT_CHECKPOINTS: &str = "__client_checkpoints__";
    pub const DEVICE: &str = "device";
}

/// The checkpoint key that holds the current global model state.
pub const GLOBAL_CHECKPOINT: &str = "__global__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Empty {}
