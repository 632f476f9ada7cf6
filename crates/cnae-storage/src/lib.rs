//! Persistence targets for CNAE records: upsert script rendering plus remote record sinks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cnae_core::{latest_by_code, IngestError, Record, DEFAULT_SQL_CHUNK_SIZE};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cnae-storage";

/// Column mapping of the classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTable {
    pub table: String,
    pub key_column: String,
    pub sector_column: String,
    pub category_column: String,
    #[serde(default)]
    pub audit_column: Option<String>,
}

impl Default for TargetTable {
    fn default() -> Self {
        Self {
            table: "cnae_classifications".to_string(),
            key_column: "cnae_code".to_string(),
            sector_column: "setor_industria".to_string(),
            category_column: "categoria".to_string(),
            audit_column: Some("updated_at".to_string()),
        }
    }
}

impl TargetTable {
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let table: TargetTable = serde_yaml::from_str(text).context("parsing table mapping")?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading table mapping {}", path.display()))
    }

    /// Identifiers are interpolated into statements, so only plain names are accepted.
    pub fn validate(&self) -> Result<(), IngestError> {
        if !is_valid_identifier(&self.table, true) {
            return Err(IngestError::Configuration(format!(
                "invalid table name `{}`",
                self.table
            )));
        }
        let columns = [
            Some(&self.key_column),
            Some(&self.sector_column),
            Some(&self.category_column),
            self.audit_column.as_ref(),
        ];
        for column in columns.into_iter().flatten() {
            if !is_valid_identifier(column, false) {
                return Err(IngestError::Configuration(format!(
                    "invalid column name `{column}`"
                )));
            }
        }
        Ok(())
    }

    /// `(schema, table)` with the schema split off when qualified.
    pub fn schema_and_name(&self) -> (Option<&str>, &str) {
        match self.table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, self.table.as_str()),
        }
    }
}

pub fn is_valid_identifier(ident: &str, allow_schema: bool) -> bool {
    let part_ok = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    match ident.split_once('.') {
        Some((schema, name)) => allow_schema && part_ok(schema) && part_ok(name),
        None => part_ok(ident),
    }
}

/// Renders a string as a single-quoted SQL literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("writing upsert script: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EmitStats {
    pub records: usize,
    pub duplicates: usize,
    pub chunks: usize,
    pub bytes: u64,
}

/// Renders records into one idempotent multi-row upsert followed by a row-count notice.
#[derive(Debug, Clone)]
pub struct SqlEmitter {
    table: TargetTable,
    chunk_size: usize,
}

impl Default for SqlEmitter {
    fn default() -> Self {
        Self {
            table: TargetTable::default(),
            chunk_size: DEFAULT_SQL_CHUNK_SIZE,
        }
    }
}

impl SqlEmitter {
    pub fn new(table: TargetTable, chunk_size: usize) -> Result<Self, IngestError> {
        table.validate()?;
        if chunk_size == 0 {
            return Err(IngestError::Configuration(
                "chunk size must be at least 1".to_string(),
            ));
        }
        Ok(Self { table, chunk_size })
    }

    pub fn table(&self) -> &TargetTable {
        &self.table
    }

    fn header(&self, records: usize, duplicates: usize) -> String {
        let t = &self.table;
        format!(
            "-- Upsert of {records} CNAE classifications into {table} ({duplicates} duplicate codes collapsed)\n\
             INSERT INTO {table} ({key}, {sector}, {category}) VALUES\n",
            table = t.table,
            key = t.key_column,
            sector = t.sector_column,
            category = t.category_column,
        )
    }

    fn conflict_clause(&self) -> String {
        let t = &self.table;
        let mut sets = vec![
            format!("{c} = EXCLUDED.{c}", c = t.sector_column),
            format!("{c} = EXCLUDED.{c}", c = t.category_column),
        ];
        if let Some(audit) = &t.audit_column {
            sets.push(format!("{audit} = NOW()"));
        }
        format!(
            "\nON CONFLICT ({key}) DO UPDATE SET {sets};\n",
            key = t.key_column,
            sets = sets.join(", ")
        )
    }

    fn verification_block(&self) -> String {
        format!(
            "\nDO $$\n\
             DECLARE\n    total_rows bigint;\n\
             BEGIN\n    SELECT COUNT(*) INTO total_rows FROM {table};\n    \
             RAISE NOTICE '{table}: % rows after upsert', total_rows;\n\
             END $$;\n",
            table = self.table.table
        )
    }

    fn render_row(out: &mut String, record: &Record) {
        out.push('(');
        out.push_str(&quote_literal(&record.code));
        out.push_str(", ");
        out.push_str(&quote_literal(&record.sector));
        out.push_str(", ");
        out.push_str(&quote_literal(&record.category));
        out.push(')');
    }

    /// Streams the script to `out`, one rendered chunk of rows at a time.
    pub async fn write_script<W>(&self, records: &[Record], out: &mut W) -> Result<EmitStats, EmitError>
    where
        W: AsyncWrite + Unpin,
    {
        let (rows, duplicates) = latest_by_code(records);
        if rows.is_empty() {
            return Err(IngestError::EmptyInput.into());
        }

        let mut stats = EmitStats {
            records: rows.len(),
            duplicates,
            ..EmitStats::default()
        };

        let header = self.header(rows.len(), duplicates);
        out.write_all(header.as_bytes()).await?;
        stats.bytes += header.len() as u64;

        let mut buf = String::new();
        for (chunk_idx, chunk) in rows.chunks(self.chunk_size).enumerate() {
            buf.clear();
            for (row_idx, record) in chunk.iter().enumerate() {
                if chunk_idx > 0 || row_idx > 0 {
                    buf.push_str(",\n");
                }
                Self::render_row(&mut buf, record);
            }
            out.write_all(buf.as_bytes()).await?;
            stats.bytes += buf.len() as u64;
            stats.chunks += 1;
            debug!(chunk = chunk_idx, rows = chunk.len(), "wrote values chunk");
        }

        for tail in [self.conflict_clause(), self.verification_block()] {
            out.write_all(tail.as_bytes()).await?;
            stats.bytes += tail.len() as u64;
        }
        out.flush().await?;

        Ok(stats)
    }

    /// In-memory rendering, for small inputs and tests.
    pub async fn render(&self, records: &[Record]) -> Result<String, EmitError> {
        let mut buf: Vec<u8> = Vec::new();
        self.write_script(records, &mut buf).await?;
        String::from_utf8(buf).map_err(|e| {
            EmitError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub stats: EmitStats,
}

/// Writes upsert scripts to disk atomically: stream into a temp file, then rename over the target.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    emitter: SqlEmitter,
}

impl ScriptStore {
    pub fn new(emitter: SqlEmitter) -> Self {
        Self { emitter }
    }

    pub async fn sha256_file(path: &Path) -> anyhow::Result<String> {
        let mut file = fs::File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub async fn write(&self, path: impl AsRef<Path>, records: &[Record]) -> anyhow::Result<ScriptArtifact> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| IngestError::Configuration(format!("output path {} has no file name", path.display())))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating script directory {}", parent.display()))?;

        let temp_path = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            Uuid::new_v4()
        ));

        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp script file {}", temp_path.display()))?;
        let mut writer = BufWriter::new(file);

        let stats = match self.emitter.write_script(records, &mut writer).await {
            Ok(stats) => stats,
            Err(err) => {
                drop(writer);
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| format!("rendering script into {}", temp_path.display()));
            }
        };
        writer
            .into_inner()
            .sync_all()
            .await
            .with_context(|| format!("syncing temp script file {}", temp_path.display()))?;

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp script {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        let sha256 = Self::sha256_file(path).await?;
        info!(path = %path.display(), records = stats.records, bytes = stats.bytes, "wrote upsert script");
        Ok(ScriptArtifact {
            path: path.to_path_buf(),
            sha256,
            stats,
        })
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid conflict key `{0}`")]
    InvalidConflictKey(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// External store accepting upserts keyed by code.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap reachability check made once before any batch is sent.
    async fn probe(&self) -> Result<(), SinkError>;

    async fn upsert(&self, records: &[Record], conflict_key: &str) -> Result<(), SinkError>;

    /// Total rows in the target table, when the sink can tell.
    async fn count(&self) -> Result<Option<u64>, SinkError> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("cnae-ingest/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Connection settings for a Supabase/PostgREST data API.
#[derive(Clone)]
pub struct SinkConfig {
    pub url: String,
    pub service_key: String,
    pub table: TargetTable,
    pub http: HttpClientConfig,
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .field("table", &self.table)
            .field("http", &self.http)
            .finish()
    }
}

fn required_env(name: &str) -> Result<String, IngestError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(IngestError::Configuration(format!("{name} must be set"))),
    }
}

/// Whole seconds, at least 1.
pub fn parse_timeout_secs(raw: &str) -> Result<Duration, IngestError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(IngestError::Configuration(format!(
            "CNAE_HTTP_TIMEOUT_SECS must be a positive number of seconds, got `{raw}`"
        ))),
    }
}

impl SinkConfig {
    pub fn from_env(table: TargetTable) -> Result<Self, IngestError> {
        let url = required_env("SUPABASE_URL")?;
        let service_key = required_env("SUPABASE_SERVICE_ROLE_KEY")?;
        let mut http = HttpClientConfig::default();
        if let Ok(raw) = std::env::var("CNAE_HTTP_TIMEOUT_SECS") {
            http.timeout = parse_timeout_secs(&raw)?;
        }
        if let Ok(user_agent) = std::env::var("CNAE_USER_AGENT") {
            http.user_agent = Some(user_agent);
        }
        Ok(Self {
            url,
            service_key,
            table,
            http,
        })
    }
}

#[derive(Debug)]
pub struct PostgrestSink {
    client: reqwest::Client,
    endpoint: String,
    table: TargetTable,
}

impl PostgrestSink {
    pub fn new(config: SinkConfig) -> anyhow::Result<Self> {
        config.table.validate()?;
        if config.url.trim().is_empty() || config.service_key.trim().is_empty() {
            return Err(IngestError::Configuration(
                "data API endpoint and service key are required".to_string(),
            )
            .into());
        }

        let (schema, name) = config.table.schema_and_name();
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.service_key).context("service key is not a valid header value")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("service key is not a valid header value")?;
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        if let Some(schema) = schema {
            let profile = HeaderValue::from_str(schema).context("schema is not a valid header value")?;
            headers.insert("accept-profile", profile.clone());
            headers.insert("content-profile", profile);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.http.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let endpoint = format!("{}/rest/v1/{}", config.url.trim_end_matches('/'), name);
        Ok(Self {
            client,
            endpoint,
            table: config.table,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn row_json(&self, record: &Record) -> JsonValue {
        let mut row = Map::with_capacity(3);
        row.insert(self.table.key_column.clone(), JsonValue::String(record.code.clone()));
        row.insert(self.table.sector_column.clone(), JsonValue::String(record.sector.clone()));
        row.insert(
            self.table.category_column.clone(),
            JsonValue::String(record.category.clone()),
        );
        JsonValue::Object(row)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > 512 {
            let mut cut = 512;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(SinkError::HttpStatus {
            status: status.as_u16(),
            url,
            body,
        })
    }
}

/// Total from a PostgREST `Content-Range` value such as `0-24/167` or `*/167`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[async_trait]
impl RecordSink for PostgrestSink {
    fn name(&self) -> &str {
        "postgrest"
    }

    async fn probe(&self) -> Result<(), SinkError> {
        let resp = self
            .client
            .head(&self.endpoint)
            .query(&[("select", self.table.key_column.as_str()), ("limit", "1")])
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn upsert(&self, records: &[Record], conflict_key: &str) -> Result<(), SinkError> {
        if !is_valid_identifier(conflict_key, false) {
            return Err(SinkError::InvalidConflictKey(conflict_key.to_string()));
        }
        let rows: Vec<JsonValue> = records.iter().map(|r| self.row_json(r)).collect();
        let span = info_span!("postgrest_upsert", endpoint = %self.endpoint, records = records.len());
        async {
            let resp = self
                .client
                .post(&self.endpoint)
                .query(&[("on_conflict", conflict_key)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&rows)
                .send()
                .await?;
            Self::check_status(resp).await?;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn count(&self) -> Result<Option<u64>, SinkError> {
        let resp = self
            .client
            .head(&self.endpoint)
            .query(&[("select", self.table.key_column.as_str())])
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let range = resp
            .headers()
            .get(CONTENT_RANGE)
            .ok_or_else(|| SinkError::Decode("missing Content-Range header".to_string()))?
            .to_str()
            .map_err(|e| SinkError::Decode(e.to_string()))?;
        Ok(parse_content_range_total(range))
    }
}

/// Direct Postgres connection settings.
#[derive(Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub table: TargetTable,
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &"<redacted>")
            .field("table", &self.table)
            .finish()
    }
}

impl PostgresConfig {
    pub fn from_env(table: TargetTable) -> Result<Self, IngestError> {
        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            table,
        })
    }
}

/// Upserts through a single Postgres connection using bound parameters.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    table: TargetTable,
}

impl PostgresSink {
    pub async fn connect(config: PostgresConfig) -> anyhow::Result<Self> {
        config.table.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&config.database_url)
            .await
            .context("connecting to DATABASE_URL")?;
        Ok(Self {
            pool,
            table: config.table,
        })
    }

    pub fn from_pool(pool: PgPool, table: TargetTable) -> Self {
        Self { pool, table }
    }

    fn upsert_builder<'a>(&self, records: &'a [Record], conflict_key: &str) -> QueryBuilder<'a, sqlx::Postgres> {
        let t = &self.table;
        let mut builder = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, {}, {}) ",
            t.table, t.key_column, t.sector_column, t.category_column
        ));
        builder.push_values(records, |mut b, r| {
            b.push_bind(r.code.as_str())
                .push_bind(r.sector.as_str())
                .push_bind(r.category.as_str());
        });
        let mut sets = vec![
            format!("{c} = EXCLUDED.{c}", c = t.sector_column),
            format!("{c} = EXCLUDED.{c}", c = t.category_column),
        ];
        if let Some(audit) = &t.audit_column {
            sets.push(format!("{audit} = NOW()"));
        }
        builder.push(format!(
            " ON CONFLICT ({conflict_key}) DO UPDATE SET {}",
            sets.join(", ")
        ));
        builder
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn probe(&self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, records: &[Record], conflict_key: &str) -> Result<(), SinkError> {
        if !is_valid_identifier(conflict_key, false) {
            return Err(SinkError::InvalidConflictKey(conflict_key.to_string()));
        }
        if records.is_empty() {
            return Ok(());
        }
        let mut builder = self.upsert_builder(records, conflict_key);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn count(&self) -> Result<Option<u64>, SinkError> {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(total).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{header, HeaderMap as AxumHeaders, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    fn rec(code: &str, sector: &str, category: &str) -> Record {
        Record {
            code: code.into(),
            sector: sector.into(),
            category: category.into(),
        }
    }

    /// Reverses [`quote_literal`] for a single literal.
    fn unquote_literal(literal: &str) -> Option<String> {
        let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
        let mut out = String::new();
        let mut chars = inner.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\'' {
                if chars.next() != Some('\'') {
                    return None;
                }
            }
            out.push(ch);
        }
        Some(out)
    }

    /// Applies the VALUES rows of a rendered script to a map keyed by code, the way
    /// Postgres would: an existing key is a unique violation unless the statement
    /// carries `ON CONFLICT (cnae_code) DO UPDATE`.
    fn apply_script(store: &mut HashMap<String, (String, String)>, script: &str) -> Result<(), String> {
        let upserts = script
            .lines()
            .any(|l| l.starts_with("ON CONFLICT (cnae_code) DO UPDATE SET"));
        let mut staged = store.clone();
        for line in script.lines().filter(|l| l.starts_with('(')) {
            let row = line.trim_end_matches(',').trim_start_matches('(').trim_end_matches(')');
            let fields = split_literals(row);
            assert_eq!(fields.len(), 3, "row: {line}");
            if staged.contains_key(&fields[0]) && !upserts {
                return Err(format!("duplicate key value violates unique constraint: {}", fields[0]));
            }
            staged.insert(fields[0].clone(), (fields[1].clone(), fields[2].clone()));
        }
        *store = staged;
        Ok(())
    }

    fn split_literals(row: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut chars = row.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\'' if in_quotes && chars.peek() == Some(&'\'') => {
                    current.push_str("''");
                    chars.next();
                }
                '\'' => {
                    in_quotes = !in_quotes;
                    current.push(ch);
                }
                ',' if !in_quotes => {
                    fields.push(unquote_literal(current.trim()).expect("literal"));
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        fields.push(unquote_literal(current.trim()).expect("literal"));
        fields
    }

    #[test]
    fn quote_literal_doubles_embedded_quotes_and_round_trips() {
        let value = "Serviços O'Brien";
        let literal = quote_literal(value);
        assert_eq!(literal, "'Serviços O''Brien'");
        assert_eq!(unquote_literal(&literal).as_deref(), Some(value));
        assert_eq!(quote_literal("'; DROP TABLE x; --"), "'''; DROP TABLE x; --'");
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(is_valid_identifier("cnae_classifications", false));
        assert!(is_valid_identifier("public.cnae_classifications", true));
        assert!(!is_valid_identifier("public.cnae_classifications", false));
        assert!(!is_valid_identifier("cnae; drop", true));
        assert!(!is_valid_identifier("1table", false));
        assert!(!is_valid_identifier("", false));

        let bad = TargetTable::default().with_table("x\"y");
        assert!(matches!(bad.validate(), Err(IngestError::Configuration(_))));
    }

    #[test]
    fn table_mapping_loads_from_yaml() {
        let yaml = "table: public.cnae\nkey_column: code\nsector_column: sector\ncategory_column: category\n";
        let table = TargetTable::from_yaml_str(yaml).expect("mapping");
        assert_eq!(table.schema_and_name(), (Some("public"), "cnae"));
        assert_eq!(table.audit_column, None);
        assert!(TargetTable::from_yaml_str("table: \"a b\"\nkey_column: k\nsector_column: s\ncategory_column: c\n").is_err());
    }

    #[tokio::test]
    async fn rendered_script_has_upsert_shape_and_verification() {
        let records = vec![
            rec("0111-3/01", "Agricultura", "Produtor"),
            rec("0159-8/02", "Serviços O'Brien", "Outros Produtores"),
        ];
        let sql = SqlEmitter::default().render(&records).await.expect("render");

        assert!(sql.contains(
            "INSERT INTO cnae_classifications (cnae_code, setor_industria, categoria) VALUES\n\
             ('0111-3/01', 'Agricultura', 'Produtor'),\n\
             ('0159-8/02', 'Serviços O''Brien', 'Outros Produtores')\n\
             ON CONFLICT (cnae_code) DO UPDATE SET setor_industria = EXCLUDED.setor_industria, \
             categoria = EXCLUDED.categoria, updated_at = NOW();"
        ));
        assert!(sql.contains("RAISE NOTICE 'cnae_classifications: % rows after upsert', total_rows;"));
        assert!(sql.trim_end().ends_with("END $$;"));
        assert_eq!(sql.matches("INSERT INTO").count(), 1);
    }

    #[tokio::test]
    async fn chunked_rendering_stays_one_statement() {
        let records = (0..1201)
            .map(|i| rec(&format!("{:04}-{}/{:02}", i / 10, i % 10, i % 100), "Setor", "Categoria"))
            .collect::<Vec<_>>();
        let emitter = SqlEmitter::new(TargetTable::default(), 500).expect("emitter");
        let mut buf: Vec<u8> = Vec::new();
        let stats = emitter.write_script(&records, &mut buf).await.expect("write");
        let sql = String::from_utf8(buf).expect("utf8");

        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.records, records.len() - stats.duplicates);
        assert_eq!(stats.bytes, sql.len() as u64);
        assert_eq!(sql.matches("INSERT INTO").count(), 1);
        assert_eq!(sql.lines().filter(|l| l.starts_with('(')).count(), stats.records);
        assert_eq!(sql.matches("),\n(").count(), stats.records - 1);
    }

    #[tokio::test]
    async fn duplicate_codes_render_once_with_latest_values() {
        let records = vec![
            rec("0111-3/01", "Agricultura", "Produtor"),
            rec("0111-3/01", "Serviços", "Outros Produtores"),
        ];
        let sql = SqlEmitter::default().render(&records).await.expect("render");
        assert_eq!(sql.matches("'0111-3/01'").count(), 1);
        assert!(sql.contains("('0111-3/01', 'Serviços', 'Outros Produtores')"));
    }

    #[tokio::test]
    async fn applying_script_twice_matches_applying_once() {
        let records = vec![
            rec("0111-3/01", "Agricultura", "Produtor"),
            rec("0500-3/01", "Energia", "Extrativismo"),
            rec("0159-8/02", "Serviços O'Brien", "Outros Produtores"),
        ];
        let sql = SqlEmitter::default().render(&records).await.expect("render");

        let mut once = HashMap::new();
        apply_script(&mut once, &sql).expect("first apply");
        let mut twice = HashMap::new();
        apply_script(&mut twice, &sql).expect("first apply");
        apply_script(&mut twice, &sql).expect("second apply");

        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
        assert_eq!(once["0159-8/02"].0, "Serviços O'Brien");
    }

    #[tokio::test]
    async fn script_without_conflict_clause_fails_on_reapply() {
        let records = vec![
            rec("0111-3/01", "Agricultura", "Produtor"),
            rec("0500-3/01", "Energia", "Extrativismo"),
        ];
        let sql = SqlEmitter::default().render(&records).await.expect("render");
        let insert_only = sql
            .lines()
            .filter(|l| !l.starts_with("ON CONFLICT"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_ne!(insert_only, sql);

        let mut store = HashMap::new();
        apply_script(&mut store, &insert_only).expect("empty store accepts plain insert");
        let err = apply_script(&mut store, &insert_only).unwrap_err();
        assert!(err.contains("0111-3/01"), "{err}");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn reapplied_script_overwrites_changed_values() {
        let first = vec![rec("0111-3/01", "Agricultura", "Produtor")];
        let second = vec![rec("0111-3/01", "Serviços", "Outros Produtores")];
        let mut store = HashMap::new();
        apply_script(&mut store, &SqlEmitter::default().render(&first).await.expect("render"))
            .expect("first apply");
        apply_script(&mut store, &SqlEmitter::default().render(&second).await.expect("render"))
            .expect("second apply");
        assert_eq!(store["0111-3/01"], ("Serviços".to_string(), "Outros Produtores".to_string()));
    }

    #[tokio::test]
    async fn empty_input_and_zero_chunk_are_rejected() {
        let err = SqlEmitter::default().render(&[]).await.unwrap_err();
        assert!(matches!(err, EmitError::Ingest(IngestError::EmptyInput)));
        assert!(matches!(
            SqlEmitter::new(TargetTable::default(), 0),
            Err(IngestError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn script_store_writes_atomically_and_hashes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("cnae.sql");
        let store = ScriptStore::new(SqlEmitter::default());
        let records = vec![rec("0111-3/01", "Agricultura", "Produtor")];

        let first = store.write(&path, &records).await.expect("first write");
        let second = store.write(&path, &records).await.expect("second write");

        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.stats.records, 1);
        let text = std::fs::read_to_string(&path).expect("script");
        assert_eq!(text.len() as u64, first.stats.bytes);
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn script_store_leaves_no_file_for_empty_input() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.sql");
        let store = ScriptStore::new(SqlEmitter::default());
        assert!(store.write(&path, &[]).await.is_err());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn content_range_totals_parse() {
        assert_eq!(parse_content_range_total("0-24/167"), Some(167));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-0/*"), None);
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        calls: Arc<Mutex<Vec<(HashMap<String, String>, Vec<JsonValue>)>>>,
        headers: Arc<Mutex<Vec<(String, String, String)>>>,
        rejected_codes: Arc<HashSet<String>>,
    }

    async fn fake_upsert(
        State(api): State<FakeApi>,
        Query(params): Query<HashMap<String, String>>,
        headers: AxumHeaders,
        Json(rows): Json<Vec<JsonValue>>,
    ) -> impl IntoResponse {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        api.headers
            .lock()
            .await
            .push((header("apikey"), header("authorization"), header("prefer")));
        let rejected = rows.iter().any(|row| {
            row.get("cnae_code")
                .and_then(JsonValue::as_str)
                .is_some_and(|code| api.rejected_codes.contains(code))
        });
        api.calls.lock().await.push((params, rows));
        if rejected {
            (StatusCode::BAD_REQUEST, "{\"message\":\"value too long\"}").into_response()
        } else {
            StatusCode::CREATED.into_response()
        }
    }

    async fn fake_head() -> impl IntoResponse {
        (StatusCode::OK, [(header::CONTENT_RANGE, "0-0/3")])
    }

    async fn spawn_fake_api(api: FakeApi) -> String {
        let app = Router::new()
            .route("/rest/v1/cnae_classifications", post(fake_upsert).head(fake_head))
            .with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn sink_for(url: String) -> PostgrestSink {
        PostgrestSink::new(SinkConfig {
            url,
            service_key: "service-key".into(),
            table: TargetTable::default(),
            http: HttpClientConfig::default(),
        })
        .expect("sink")
    }

    #[tokio::test]
    async fn postgrest_sink_sends_merge_upsert_with_credentials() {
        let api = FakeApi::default();
        let url = spawn_fake_api(api.clone()).await;
        let sink = sink_for(url.clone());
        assert_eq!(sink.endpoint(), format!("{url}/rest/v1/cnae_classifications"));

        sink.probe().await.expect("probe");
        sink.upsert(&[rec("0111-3/01", "Agricultura", "Produtor")], "cnae_code")
            .await
            .expect("upsert");
        assert_eq!(sink.count().await.expect("count"), Some(3));

        let calls = api.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.get("on_conflict").map(String::as_str), Some("cnae_code"));
        assert_eq!(
            calls[0].1,
            vec![serde_json::json!({
                "cnae_code": "0111-3/01",
                "setor_industria": "Agricultura",
                "categoria": "Produtor"
            })]
        );
        let headers = api.headers.lock().await;
        assert_eq!(headers[0].0, "service-key");
        assert_eq!(headers[0].1, "Bearer service-key");
        assert_eq!(headers[0].2, "resolution=merge-duplicates,return=minimal");
    }

    #[tokio::test]
    async fn postgrest_sink_maps_rejections_to_http_status_errors() {
        let api = FakeApi {
            rejected_codes: Arc::new(HashSet::from(["0111-3/01".to_string()])),
            ..FakeApi::default()
        };
        let sink = sink_for(spawn_fake_api(api).await);
        let err = sink
            .upsert(&[rec("0111-3/01", "Agricultura", "Produtor")], "cnae_code")
            .await
            .unwrap_err();
        match err {
            SinkError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 400);
                assert!(body.contains("value too long"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            sink.upsert(&[], "cnae_code; drop").await,
            Err(SinkError::InvalidConflictKey(_))
        ));
    }

    #[tokio::test]
    async fn postgrest_probe_fails_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let sink = sink_for(format!("http://{addr}"));
        assert!(matches!(sink.probe().await, Err(SinkError::Request(_))));
    }

    #[test]
    fn sink_config_debug_redacts_key() {
        let config = SinkConfig {
            url: "https://example.supabase.co".into(),
            service_key: "super-secret".into(),
            table: TargetTable::default(),
            http: HttpClientConfig::default(),
        };
        let text = format!("{config:?}");
        assert!(!text.contains("super-secret"));
        assert!(PostgrestSink::new(SinkConfig {
            url: "  ".into(),
            ..config
        })
        .is_err());
    }

    #[test]
    fn http_timeout_must_be_positive_seconds() {
        assert_eq!(parse_timeout_secs(" 45 ").expect("timeout"), Duration::from_secs(45));
        for bad in ["", "0", "-3", "30s", "1.5"] {
            assert!(
                matches!(parse_timeout_secs(bad), Err(IngestError::Configuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    fn lazy_postgres_sink() -> PostgresSink {
        use sqlx::postgres::PgConnectOptions;
        let pool = PgPoolOptions::new().connect_lazy_with(PgConnectOptions::new());
        PostgresSink::from_pool(pool, TargetTable::default())
    }

    #[tokio::test]
    async fn postgres_upsert_binds_rows_and_updates_on_conflict() {
        let sink = lazy_postgres_sink();
        let records = vec![
            rec("0111-3/01", "Agricultura", "Produtor"),
            rec("0159-8/02", "Serviços O'Brien", "Outros Produtores"),
        ];
        let builder = sink.upsert_builder(&records, "cnae_code");
        assert_eq!(
            builder.sql(),
            "INSERT INTO cnae_classifications (cnae_code, setor_industria, categoria) \
             VALUES ($1, $2, $3), ($4, $5, $6) \
             ON CONFLICT (cnae_code) DO UPDATE SET setor_industria = EXCLUDED.setor_industria, \
             categoria = EXCLUDED.categoria, updated_at = NOW()"
        );
        assert!(!builder.sql().contains("O'Brien"));
    }

    #[tokio::test]
    async fn postgres_upsert_guards_conflict_key_and_skips_empty_batches() {
        let sink = lazy_postgres_sink();
        assert_eq!(sink.name(), "postgres");
        assert!(matches!(
            sink.upsert(&[], "cnae_code; drop").await,
            Err(SinkError::InvalidConflictKey(key)) if key == "cnae_code; drop"
        ));
        sink.upsert(&[], "cnae_code").await.expect("empty batch needs no connection");
    }
}
