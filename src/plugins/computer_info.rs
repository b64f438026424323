//! Basic computer facts reported to the server
//!
//! Reports `hostname`, `total-memory`, `total-swap` and `annotations` as a
//! `computer-info` message. Only fields whose value changed since the last
//! queued report are sent.

use crate::broker::BrokerHandle;
use crate::config::ClientSection;
use crate::error::BrokerError;
use crate::protocol::Message;
use crate::registry::{BrokerClient, ClientError, Connector, ConnectorContext, ConnectorFactory};
use crate::store::MessageId;
use crate::system;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const NAME: &str = "computer-info";

/// Resynchronize scope this plugin belongs to
const SCOPE: &str = "computer";

/// Failures while gathering or queueing a report
#[derive(Debug, Error)]
pub enum ComputerInfoError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: no memory totals", path.display())]
    MissingTotals { path: PathBuf },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ComputerInfoError {
    pub fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

type ComputerInfoResult<T> = Result<T, ComputerInfoError>;

type HostnameSource = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Default)]
struct ReportState {
    session_id: Option<String>,
    last_report: Map<String, Value>,
}

pub struct ComputerInfo {
    broker: BrokerHandle,
    meminfo_path: PathBuf,
    annotations_path: Option<PathBuf>,
    hostname: HostnameSource,
    state: Mutex<ReportState>,
}

impl ComputerInfo {
    pub fn new(broker: BrokerHandle, client: &ClientSection) -> Self {
        Self {
            broker,
            meminfo_path: client.meminfo_path.clone(),
            annotations_path: client.annotations_path.clone(),
            hostname: Arc::new(system::hostname),
            state: Mutex::new(ReportState::default()),
        }
    }

    /// Replace where the host name comes from
    pub fn with_hostname<F>(self, hostname: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            hostname: Arc::new(hostname),
            ..self
        }
    }

    /// Current facts, before comparing against the last report
    async fn collect(&self) -> ComputerInfoResult<Map<String, Value>> {
        let meminfo = tokio::fs::read_to_string(&self.meminfo_path)
            .await
            .map_err(|e| ComputerInfoError::io(&self.meminfo_path, e))?;
        let memory = system::parse_meminfo(&meminfo).ok_or_else(|| {
            ComputerInfoError::MissingTotals {
                path: self.meminfo_path.clone(),
            }
        })?;

        let mut facts = Map::new();
        facts.insert("hostname".into(), json!((self.hostname)()));
        facts.insert("total-memory".into(), json!(memory.total_memory));
        facts.insert("total-swap".into(), json!(memory.total_swap));

        if let Some(ref path) = self.annotations_path {
            let annotations = read_annotations(path).await?;
            if !annotations.is_empty() {
                facts.insert("annotations".into(), Value::Object(annotations));
            }
        }
        Ok(facts)
    }

    /// Queue a `computer-info` message with whatever changed
    ///
    /// Returns `None` when nothing changed, the server does not accept the
    /// type, or the message was discarded.
    pub async fn send_computer_message(
        &self,
        urgent: bool,
    ) -> ComputerInfoResult<Option<MessageId>> {
        if !self.broker.accepts(NAME)? {
            return Ok(None);
        }

        let facts = self.collect().await?;
        let mut state = self.state.lock().await;

        let changed: Map<String, Value> = facts
            .into_iter()
            .filter(|(key, value)| state.last_report.get(key) != Some(value))
            .collect();
        if changed.is_empty() {
            return Ok(None);
        }

        let session_id = match state.session_id.clone() {
            Some(session_id) => session_id,
            None => {
                let session_id = self.broker.get_session_id()?;
                state.session_id = Some(session_id.clone());
                session_id
            }
        };

        let mut message = Message::new();
        message.insert("type".into(), json!(NAME));
        message.extend(changed.clone());

        info!("Queueing message with updated computer info.");
        let queued = self.broker.send_message(message, Some(&session_id), urgent)?;
        if queued.is_some() {
            state.last_report.extend(changed);
        }
        Ok(queued)
    }

    async fn resynchronize(&self, scopes: Option<&Value>) -> ComputerInfoResult<()> {
        let in_scope = match scopes.and_then(Value::as_array) {
            Some(scopes) if !scopes.is_empty() => scopes.iter().any(|s| s == SCOPE),
            _ => true,
        };
        if !in_scope {
            return Ok(());
        }

        let session_id = self.broker.get_session_id()?;
        let mut state = self.state.lock().await;
        state.last_report.clear();
        state.session_id = Some(session_id);
        debug!("Computer info will be reported again");
        Ok(())
    }
}

async fn read_annotations(path: &Path) -> ComputerInfoResult<Map<String, Value>> {
    let mut annotations = Map::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(annotations),
        Err(e) => return Err(ComputerInfoError::io(path, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ComputerInfoError::io(path, e))?
    {
        let key = entry.file_name().to_string_lossy().into_owned();
        let content = tokio::fs::read_to_string(entry.path())
            .await
            .map_err(|e| ComputerInfoError::io(entry.path(), e))?;
        annotations.insert(key, json!(content));
    }
    Ok(annotations)
}

#[async_trait]
impl BrokerClient for ComputerInfo {
    fn name(&self) -> &str {
        NAME
    }

    async fn message(&self, _message: &Message) -> Result<bool, ClientError> {
        Ok(false)
    }

    async fn fire_event(&self, event: &str, args: &[Value]) -> Result<Value, ClientError> {
        let result = match event {
            "impending-exchange" => self.send_computer_message(false).await.map(|_| ()),
            "message-type-acceptance-changed"
                if args.first().and_then(Value::as_str) == Some(NAME)
                    && args.get(1) == Some(&Value::Bool(true)) =>
            {
                self.send_computer_message(true).await.map(|_| ())
            }
            "resynchronize" => self.resynchronize(args.first()).await,
            _ => Ok(()),
        };
        result
            .map(|()| Value::Null)
            .map_err(|e| ClientError::event_failed(NAME, event, e.to_string()))
    }

    async fn exit(&self) -> Result<(), ClientError> {
        debug!("Computer info plugin exiting");
        Ok(())
    }
}

struct ComputerInfoConnector {
    context: ConnectorContext,
}

#[async_trait]
impl Connector for ComputerInfoConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, ClientError> {
        Ok(Arc::new(ComputerInfo::new(
            self.context.broker.clone(),
            &self.context.config.client,
        )))
    }
}

pub fn connector_factory() -> ConnectorFactory {
    Arc::new(|context: &ConnectorContext| {
        Arc::new(ComputerInfoConnector {
            context: context.clone(),
        }) as Arc<dyn Connector>
    })
}
