//! Channel frames exchanged with the kernel, JSON tagged by `type`

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Kernel → agent
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Incoming {
    Exec {
        request_id: String,
        command: String,
        timeout_ms: u64,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        stream: bool,
    },
    Cancel {
        request_id: String,
    },
    Ping {
        nonce: String,
    },
}

/// Agent → kernel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outgoing {
    Hello {
        version: String,
        timestamp: Option<String>,
    },
    Chunk {
        request_id: String,
        stream: StreamName,
        data: String,
    },
    #[serde(rename = "result")]
    Completed {
        request_id: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    Failed {
        request_id: String,
        error: String,
    },
    Pong {
        nonce: String,
    },
}

impl Outgoing {
    /// Request this frame closes, if any
    pub fn terminal_for(&self) -> Option<&str> {
        match self {
            Outgoing::Completed { request_id, .. } | Outgoing::Failed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}
