use super::traits::{Sink, SinkError, SinkStatement, SinkTransaction};
use crate::config::types::ClickHouseConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// Escape a string value for use inside a ClickHouse single-quoted literal.
fn escape_ch_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn render_tuple(values: &[String]) -> String {
    let literals: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", escape_ch_string(v)))
        .collect();
    format!("({})", literals.join(", "))
}

/// Connection details shared by the sink and its open transactions.
struct Endpoint {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
}

impl Endpoint {
    async fn exec(&self, sql: String) -> Result<String, SinkError> {
        let resp = self
            .http
            .post(&self.base_url)
            .basic_auth(&self.user, Some(&self.password))
            .query(&[("database", self.database.as_str())])
            .body(sql)
            .send()
            .await?;
        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<String, SinkError> {
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(SinkError::Status { status, body })
    }
}

/// ClickHouse over its HTTP interface.
///
/// A transaction buffers rendered rows and sends them as a single
/// `INSERT ... VALUES` on commit; one insert is applied atomically.
pub struct ClickHouseSink {
    endpoint: Arc<Endpoint>,
    target: String,
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, SinkError> {
        let scheme = if config.tls { "https" } else { "http" };
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            endpoint: Arc::new(Endpoint {
                http,
                base_url: format!("{}://{}:{}", scheme, config.host, config.port),
                user: config.username.clone(),
                password: config.password.clone(),
                database: config.database.clone(),
            }),
            target: config.target(),
        })
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        Ok(Box::new(ClickHouseTransaction {
            endpoint: self.endpoint.clone(),
            insert: None,
            tuples: Vec::new(),
        }))
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let url = format!("{}/ping", self.endpoint.base_url);
        let resp = self.endpoint.http.get(url).send().await?;
        check_status(resp).await.map(|_| ())
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

struct ClickHouseTransaction {
    endpoint: Arc<Endpoint>,
    /// `INSERT INTO t (cols)` part of the prepared statement.
    insert: Option<String>,
    tuples: Vec<String>,
}

/// Split `INSERT INTO t (a, b) VALUES (?, ?)` into its head and placeholder
/// count.
fn parse_insert(sql: &str) -> Result<(String, usize), SinkError> {
    let upper = sql.to_ascii_uppercase();
    let at = upper
        .rfind("VALUES")
        .filter(|_| upper.trim_start().starts_with("INSERT"))
        .ok_or_else(|| SinkError::Statement(sql.to_string()))?;

    let (head, tail) = sql.split_at(at);
    let tail = tail["VALUES".len()..].trim();
    let group = tail
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| SinkError::Statement(sql.to_string()))?;

    let placeholders = group.split(',').map(str::trim).collect::<Vec<_>>();
    if placeholders.iter().any(|p| *p != "?") {
        return Err(SinkError::Statement(sql.to_string()));
    }
    Ok((head.trim_end().to_string(), placeholders.len()))
}

#[async_trait]
impl SinkTransaction for ClickHouseTransaction {
    async fn prepare<'a>(
        &'a mut self,
        sql: &str,
    ) -> Result<Box<dyn SinkStatement + 'a>, SinkError> {
        let (head, width) = parse_insert(sql)?;
        self.insert = Some(head);
        Ok(Box::new(ClickHouseStatement { tx: self, width }))
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        let Some(insert) = self.insert.as_deref() else {
            return Ok(());
        };
        if self.tuples.is_empty() {
            return Ok(());
        }
        let sql = format!("{} VALUES {}", insert, self.tuples.join(", "));
        self.endpoint.exec(sql).await?;
        Ok(())
    }
}

struct ClickHouseStatement<'a> {
    tx: &'a mut ClickHouseTransaction,
    width: usize,
}

#[async_trait]
impl SinkStatement for ClickHouseStatement<'_> {
    async fn execute(&mut self, values: &[String]) -> Result<(), SinkError> {
        if values.len() != self.width {
            return Err(SinkError::Arity {
                expected: self.width,
                found: values.len(),
            });
        }
        self.tx.tuples.push(render_tuple(values));
        Ok(())
    }
}
