use crate::error::{ConnectError, FetchError, TerminateError};
use crate::gateway::{OperationsGateway, ServerFilter};
use crate::model::{KillTarget, OpId, Operation, OperationType, is_system_operation};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Database};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TYPE_MISMATCH_CODE: i32 = 14;
const SYSTEM_NAMESPACE_PATTERNS: [&str; 3] = ["^admin\\.", "^config\\.", "^local\\."];

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_source: String,
    pub load_balanced: bool,
    pub app_name: String,
}

impl ConnectionSettings {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: self.host.clone(),
            port: Some(self.port),
        }];
        options.app_name = Some(self.app_name.clone());
        options.server_selection_timeout = Some(CONNECT_TIMEOUT);
        options.connect_timeout = Some(CONNECT_TIMEOUT);
        if self.load_balanced {
            options.load_balanced = Some(true);
        }
        if let Some(username) = &self.username {
            let mut credential = Credential::default();
            credential.username = Some(username.clone());
            credential.password = self.password.clone();
            credential.source = Some(self.auth_source.clone());
            options.credential = Some(credential);
        }
        options
    }
}

/// MongoDB-backed gateway. The client is created on first use and dropped
/// whenever a call fails for connectivity reasons, so the next call reconnects.
pub struct MongoGateway {
    settings: ConnectionSettings,
    client: Mutex<Option<Client>>,
}

impl MongoGateway {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            client: Mutex::new(None),
        }
    }

    async fn admin(&self) -> Result<Database, ConnectError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.database("admin"));
        }

        let client = Client::with_options(self.settings.client_options())
            .map_err(|error| classify_connect_error(&error))?;
        let admin = client.database("admin");
        admin
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|error| classify_connect_error(&error))?;

        match admin.run_command(doc! { "serverStatus": 1 }).await {
            Ok(status) => info!(
                "connected to MongoDB {} ({}) at {}",
                status.get_str("version").unwrap_or("unknown version"),
                status.get_str("process").unwrap_or("unknown process"),
                self.settings.endpoint()
            ),
            Err(error) => warn!(
                "connected to {} but serverStatus failed: {}",
                self.settings.endpoint(),
                error
            ),
        }

        *slot = Some(client);
        Ok(admin)
    }

    async fn forget_client(&self, error: &MongoError) {
        if is_connectivity_error(error) {
            warn!("dropping MongoDB client after connectivity error: {}", error);
            self.client.lock().await.take();
        }
    }

    async fn send_kill(
        &self,
        admin: &Database,
        id: &OpId,
        target: Bson,
    ) -> Result<(), TerminateError> {
        match admin.run_command(doc! { "killOp": 1, "op": target }).await {
            Ok(reply) if reply.get("ok").and_then(bson_number) == Some(1.0) => Ok(()),
            Ok(reply) => Err(TerminateError::Rejected {
                id: id.to_string(),
                reason: format!("server replied {reply}"),
            }),
            Err(error) => {
                self.forget_client(&error).await;
                Err(classify_terminate_error(id, &error))
            }
        }
    }
}

#[async_trait]
impl OperationsGateway for MongoGateway {
    async fn connect(&self) -> Result<(), ConnectError> {
        self.admin().await.map(|_| ())
    }

    async fn fetch_operations(&self, filter: &ServerFilter) -> Result<Vec<Operation>, FetchError> {
        let admin = self.admin().await?;

        let mut cursor = match admin.aggregate(current_op_pipeline(filter)).await {
            Ok(cursor) => cursor,
            Err(error) => {
                self.forget_client(&error).await;
                return Err(classify_fetch_error(&error));
            }
        };

        let mut operations = Vec::new();
        let mut seen = HashSet::new();
        loop {
            let document = match cursor.try_next().await {
                Ok(Some(document)) => document,
                Ok(None) => break,
                Err(error) => {
                    self.forget_client(&error).await;
                    return Err(classify_fetch_error(&error));
                }
            };

            match operation_from_document(document) {
                Ok(operation) if seen.insert(operation.id.clone()) => operations.push(operation),
                Ok(operation) => warn!("ignoring duplicate opid {} in currentOp output", operation.id),
                Err(error) => warn!("skipping operation record: {}", error),
            }
        }

        Ok(operations)
    }

    async fn terminate(&self, id: &OpId) -> Result<(), TerminateError> {
        if id.is_empty() {
            return Err(TerminateError::InvalidId(id.to_string()));
        }

        let admin = self.admin().await?;
        let result = self.send_kill(&admin, id, kill_target_bson(id.kill_target())).await;
        match (result, id.shard_local_part()) {
            (Err(TerminateError::TypeMismatch { .. }), Some(local)) => {
                info!("retrying kill of {} with shard-local opid {}", id, local);
                self.send_kill(&admin, id, Bson::Int64(local)).await
            }
            (result, _) => result,
        }
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            info!("closed MongoDB client for {}", self.settings.endpoint());
        }
    }
}

pub fn current_op_pipeline(filter: &ServerFilter) -> Vec<Document> {
    let mut clauses = vec![doc! { "active": true }];

    if !filter.include_system {
        let mut excluded = SYSTEM_NAMESPACE_PATTERNS
            .iter()
            .map(|pattern| doc! { "ns": { "$regex": *pattern, "$options": "i" } })
            .collect::<Vec<_>>();
        excluded.push(doc! { "op": "none" });
        excluded.push(doc! { "effectiveUsers.user": "__system" });
        excluded.push(doc! { "op": "command", "command.cursor": { "$exists": true } });
        clauses.push(doc! { "$nor": excluded });
    }

    if let Some(prefix) = &filter.namespace_prefix {
        clauses.push(doc! {
            "ns": { "$regex": format!("^{}", regex::escape(prefix)), "$options": "i" }
        });
    }

    if let Some(id) = &filter.opid {
        clauses.push(doc! { "opid": kill_target_bson(id.kill_target()) });
    }

    vec![
        doc! {
            "$currentOp": {
                "allUsers": true,
                "idleConnections": false,
                "idleCursors": false,
                "idleSessions": true,
                "localOps": false,
                "backtrace": false,
            }
        },
        doc! { "$match": { "$and": clauses } },
    ]
}

pub fn operation_from_document(mut document: Document) -> Result<Operation, FetchError> {
    let id = match document.remove("opid") {
        Some(Bson::Int32(value)) => value.to_string(),
        Some(Bson::Int64(value)) => value.to_string(),
        Some(Bson::Double(value)) if value.fract() == 0.0 => (value as i64).to_string(),
        Some(Bson::String(value)) if !value.trim().is_empty() => value,
        Some(other) => {
            return Err(FetchError::Malformed(format!("unsupported opid {other}")));
        }
        None => return Err(FetchError::Malformed("record without opid".to_string())),
    };

    let op_type =
        OperationType::from_token(take_string(&mut document, "op").as_deref().unwrap_or(""));
    let namespace = take_string(&mut document, "ns").unwrap_or_default();
    let elapsed_secs = document
        .remove("secs_running")
        .as_ref()
        .and_then(bson_number)
        .map(|secs| secs.max(0.0) as u64)
        .unwrap_or(0);
    let description = take_string(&mut document, "desc").unwrap_or_default();

    let mongos_host = document
        .get_document("clientMetadata")
        .ok()
        .and_then(|metadata| metadata.get_document("mongos").ok())
        .and_then(|mongos| mongos.get_str("host").ok())
        .map(|host| host.split('.').next().unwrap_or(host).to_string());
    let client = take_string(&mut document, "client")
        .or_else(|| take_string(&mut document, "client_s"))
        .map(|client| match &mongos_host {
            Some(host) => format!("{client} ({host})"),
            None => client,
        });

    let effective_users = document
        .get_array("effectiveUsers")
        .map(|users| {
            users
                .iter()
                .filter_map(|user| user.as_document())
                .filter_map(|user| user.get_str("user").ok())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let has_cursor_command = document
        .get_document("command")
        .map(|command| command.contains_key("cursor"))
        .unwrap_or(false);
    let is_system = is_system_operation(&namespace, &op_type, &effective_users, has_cursor_command);

    let mut operation = Operation::new(id, op_type, elapsed_secs);
    operation.namespace = namespace;
    operation.client = client;
    operation.description = description;
    operation.effective_users = effective_users;
    operation.is_system = is_system;
    operation.extra = document
        .into_iter()
        .map(|(key, value)| (key, value.into_relaxed_extjson()))
        .collect();
    Ok(operation)
}

fn take_string(document: &mut Document, key: &str) -> Option<String> {
    if !matches!(document.get(key), Some(Bson::String(_))) {
        return None;
    }
    match document.remove(key) {
        Some(Bson::String(value)) => Some(value),
        _ => None,
    }
}

fn bson_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(value) => Some(f64::from(*value)),
        Bson::Int64(value) => Some(*value as f64),
        Bson::Double(value) => Some(*value),
        _ => None,
    }
}

fn kill_target_bson(target: KillTarget) -> Bson {
    match target {
        KillTarget::Numeric(value) => Bson::Int64(value),
        KillTarget::Named(value) => Bson::String(value),
    }
}

fn is_connectivity_error(error: &MongoError) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::DnsResolve { .. }
    )
}

fn classify_connect_error(error: &MongoError) -> ConnectError {
    match error.kind.as_ref() {
        ErrorKind::Authentication { message, .. } => ConnectError::Authentication(message.clone()),
        ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            ConnectError::Timeout(io.to_string())
        }
        ErrorKind::Io(io) => ConnectError::Unreachable(io.to_string()),
        ErrorKind::ServerSelection { message, .. } | ErrorKind::DnsResolve { message, .. } => {
            ConnectError::Unreachable(message.clone())
        }
        _ if error.to_string().to_ascii_lowercase().contains("timed out") => {
            ConnectError::Timeout(error.to_string())
        }
        _ => ConnectError::Other(error.to_string()),
    }
}

fn classify_fetch_error(error: &MongoError) -> FetchError {
    if is_connectivity_error(error) {
        FetchError::Connect(classify_connect_error(error))
    } else {
        FetchError::Command(error.to_string())
    }
}

fn classify_terminate_error(id: &OpId, error: &MongoError) -> TerminateError {
    match error.kind.as_ref() {
        ErrorKind::Command(command)
            if command.code == TYPE_MISMATCH_CODE || command.code_name == "TypeMismatch" =>
        {
            TerminateError::TypeMismatch {
                id: id.to_string(),
                reason: command.message.clone(),
            }
        }
        ErrorKind::Command(command)
            if command.code_name == "ShardNotFound"
                || command.message.to_ascii_lowercase().contains("not found") =>
        {
            TerminateError::NotFound(id.to_string())
        }
        _ if is_connectivity_error(error) => TerminateError::Connect(classify_connect_error(error)),
        _ => TerminateError::Rejected {
            id: id.to_string(),
            reason: error.to_string(),
        },
    }
}
