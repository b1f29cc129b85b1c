//! Transports d'exécution : un contrat, deux adaptateurs.
//!
//! - `AgentTransport` : canal persistant ouvert par l'agent résident
//! - `ShellTransport` : session ssh ponctuelle (ou shell local pour localhost)
//!
//! Le choix entre les deux appartient au dispatcher, jamais aux appelants.

mod agent;
mod shell;

pub use agent::AgentTransport;
pub use shell::{ShellOptions, ShellTransport};

use crate::errors::ExecError;
use crate::models::{ExecOutput, StreamName};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Exécution bufferisée. Un code de sortie non nul n'est PAS une erreur ici :
    /// c'est le dispatcher qui le classe.
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError>;

    /// Exécution en flux : chaque morceau part vers `sink` dès réception.
    /// Retourne le code de sortie ; `cancel` tue le processus distant.
    async fn stream(
        &self,
        host: &str,
        command: &str,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError>;
}

/// Destinataire d'une exécution en flux.
/// Reçoit zéro ou plusieurs `on_chunk`, puis exactement un `on_done` ou `on_error`.
pub trait OutputSink: Send {
    fn on_chunk(&mut self, stream: StreamName, text: &str);
    fn on_done(&mut self, exit_code: i32);
    fn on_error(&mut self, message: &str);

    /// Nombre de morceaux déjà transmis (sert à décider si une bascule est encore possible)
    fn chunks_sent(&self) -> usize;
}

/// Décodage UTF-8 incrémental d'un flux d'octets lu par morceaux.
/// Un caractère coupé entre deux lectures est conservé jusqu'à la suivante.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        // séquence invalide : remplacée, on continue après
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // séquence incomplète en fin de lecture
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }

    /// Octets restants à la fin du flux
    pub fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}

/// Événement de flux, forme sérialisée vers les clients HTTP
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk { stream: StreamName, data: String },
    Done { exit_code: i32 },
    Error { message: String },
}

/// Sink adossé à un canal : le récepteur peut disparaître (client parti),
/// les envois deviennent alors silencieusement sans effet.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    sent: usize,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tx, sent: 0 }
    }
}

impl OutputSink for ChannelSink {
    fn on_chunk(&mut self, stream: StreamName, text: &str) {
        self.sent += 1;
        let _ = self.tx.send(StreamEvent::Chunk { stream, data: text.to_string() });
    }

    fn on_done(&mut self, exit_code: i32) {
        let _ = self.tx.send(StreamEvent::Done { exit_code });
    }

    fn on_error(&mut self, message: &str) {
        let _ = self.tx.send(StreamEvent::Error { message: message.to_string() });
    }

    fn chunks_sent(&self) -> usize {
        self.sent
    }
}
