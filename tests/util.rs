#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use sitebackup_lib::config::{DatabaseConnectionConfig, EngineType, Settings};
use sitebackup_lib::db::{Connector, RowSink, SqlConnection, SqlValue};
use sitebackup_lib::notify::{CacheInvalidator, SessionInvalidator};
use sitebackup_lib::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone)]
struct Table {
    name: String,
    create: String,
    rows: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Default)]
struct Store {
    tables: Vec<Table>,
    executed: Vec<String>,
    dropped: Vec<String>,
    fail_on: Option<String>,
    fail_stream: Option<String>,
    connects: usize,
    reconnects: usize,
}

impl Store {
    fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }
}

/// A shared in-memory "server". Every connection opened through
/// [`MemoryServer::connector`] sees the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<Store>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    pub fn create_table(&self, name: &str, columns: &str, charset: &str) {
        let create = format!(
            "CREATE TABLE `{name}` (\n  {columns}\n) ENGINE=InnoDB DEFAULT CHARSET={charset}"
        );
        self.inner.lock().unwrap().tables.push(Table {
            name: name.to_string(),
            create,
            rows: Vec::new(),
        });
    }

    pub fn insert(&self, name: &str, row: Vec<SqlValue>) {
        let mut store = self.inner.lock().unwrap();
        store.table_mut(name).expect("table exists").rows.push(row);
    }

    pub fn tables(&self) -> Vec<String> {
        let store = self.inner.lock().unwrap();
        store.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn rows(&self, name: &str) -> Vec<Vec<SqlValue>> {
        let store = self.inner.lock().unwrap();
        store
            .tables
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.rows(name).len()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.inner.lock().unwrap().dropped.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.inner.lock().unwrap().executed.clone()
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().unwrap().connects
    }

    pub fn reconnects(&self) -> usize {
        self.inner.lock().unwrap().reconnects
    }

    /// Makes every statement containing `needle` fail like a syntax error.
    pub fn fail_on(&self, needle: &str) {
        self.inner.lock().unwrap().fail_on = Some(needle.to_string());
    }

    /// Makes streaming `table` fail after it was opened.
    pub fn fail_stream(&self, table: &str) {
        self.inner.lock().unwrap().fail_stream = Some(table.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, _config: &DatabaseConnectionConfig) -> AppResult<MemoryConnection> {
        self.server.inner.lock().unwrap().connects += 1;
        Ok(MemoryConnection {
            server: self.server.clone(),
            open: true,
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    server: MemoryServer,
    open: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(AppError::of(ErrorKind::Connection, "connection is closed"))
        }
    }
}

impl SqlConnection for MemoryConnection {
    async fn server_version(&mut self) -> AppResult<String> {
        self.check_open()?;
        Ok("10.11.0-MemoryDB".to_string())
    }

    async fn list_tables(&mut self) -> AppResult<Vec<String>> {
        self.check_open()?;
        Ok(self.server.tables())
    }

    async fn show_create_table(&mut self, table: &str) -> AppResult<String> {
        self.check_open()?;
        let store = self.server.inner.lock().unwrap();
        store
            .tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.create.clone())
            .ok_or_else(|| AppError::new("MySql/42S02", format!("Table '{table}' doesn't exist")))
    }

    async fn stream_rows(&mut self, table: &str, sink: &mut dyn RowSink) -> AppResult<u64> {
        self.check_open()?;
        let (rows, fail) = {
            let store = self.server.inner.lock().unwrap();
            (
                self.server_rows(&store, table),
                store.fail_stream.as_deref() == Some(table),
            )
        };
        let mut count = 0;
        for row in rows {
            if fail && count == 1 {
                return Err(AppError::new("MySql/2013", "Lost connection during query"));
            }
            sink.push_row(row)?;
            count += 1;
        }
        if fail {
            return Err(AppError::new("MySql/2013", "Lost connection during query"));
        }
        Ok(count)
    }

    async fn execute(&mut self, sql: &str) -> AppResult<()> {
        self.check_open()?;
        let mut store = self.server.inner.lock().unwrap();
        store.executed.push(sql.to_string());
        if let Some(needle) = &store.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(AppError::new(
                    "MySql/1064",
                    "You have an error in your SQL syntax",
                ));
            }
        }
        apply(&mut store, sql)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        self.open = true;
        self.server.inner.lock().unwrap().reconnects += 1;
        Ok(())
    }
}

impl MemoryConnection {
    fn server_rows(&self, store: &Store, table: &str) -> Vec<Vec<SqlValue>> {
        store
            .tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

fn apply(store: &mut Store, sql: &str) -> AppResult<()> {
    let trimmed = sql.trim();
    let upper = trimmed.to_ascii_uppercase();
    if let Some(rest) = strip_prefix_ci(trimmed, &upper, "DROP TABLE IF EXISTS ") {
        let (name, _) = parse_ident(rest);
        if let Some(pos) = store.tables.iter().position(|t| t.name == name) {
            store.tables.remove(pos);
        }
        store.dropped.push(name);
    } else if let Some(rest) = strip_prefix_ci(trimmed, &upper, "CREATE TABLE ") {
        let (name, _) = parse_ident(rest);
        if store.tables.iter().any(|t| t.name == name) {
            return Err(AppError::new("MySql/42S01", format!("Table '{name}' already exists")));
        }
        store.tables.push(Table {
            name,
            create: trimmed.to_string(),
            rows: Vec::new(),
        });
    } else if let Some(rest) = strip_prefix_ci(trimmed, &upper, "INSERT INTO ") {
        let (name, tail) = parse_ident(rest);
        let values = tail
            .trim_start()
            .strip_prefix("VALUES")
            .ok_or_else(|| AppError::new("MySql/1064", "expected VALUES"))?;
        let rows = parse_tuples(values)?;
        let table = store
            .table_mut(&name)
            .ok_or_else(|| AppError::new("MySql/42S02", format!("Table '{name}' doesn't exist")))?;
        table.rows.extend(rows);
    }
    Ok(())
}

fn strip_prefix_ci<'a>(sql: &'a str, upper: &str, prefix: &str) -> Option<&'a str> {
    upper.starts_with(prefix).then(|| &sql[prefix.len()..])
}

fn parse_ident(input: &str) -> (String, &str) {
    let input = input.trim_start();
    if let Some(rest) = input.strip_prefix('`') {
        let mut name = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, ch)) = chars.next() {
            if ch == '`' {
                if matches!(chars.peek(), Some((_, '`'))) {
                    chars.next();
                    name.push('`');
                } else {
                    return (name, &rest[i + 1..]);
                }
            } else {
                name.push(ch);
            }
        }
        (name, "")
    } else {
        let end = input
            .find(|c: char| c.is_whitespace() || c == '(')
            .unwrap_or(input.len());
        (input[..end].to_string(), &input[end..])
    }
}

fn parse_tuples(input: &str) -> AppResult<Vec<Vec<SqlValue>>> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut rows = Vec::new();
    let bad = |msg: &str| AppError::new("MySql/1064", msg.to_string());

    loop {
        while i < chars.len() && (chars[i].is_whitespace() || chars[i] == ',') {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        if chars[i] != '(' {
            return Err(bad("expected ("));
        }
        i += 1;
        let mut row = Vec::new();
        loop {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            let ch = *chars.get(i).ok_or_else(|| bad("unterminated tuple"))?;
            if ch == '\'' {
                i += 1;
                let mut text = String::new();
                loop {
                    let c = *chars.get(i).ok_or_else(|| bad("unterminated string"))?;
                    i += 1;
                    match c {
                        '\\' => {
                            let e = *chars.get(i).ok_or_else(|| bad("bad escape"))?;
                            i += 1;
                            text.push(match e {
                                '0' => '\0',
                                'n' => '\n',
                                'r' => '\r',
                                'Z' => '\u{1a}',
                                other => other,
                            });
                        }
                        '\'' if chars.get(i) == Some(&'\'') => {
                            text.push('\'');
                            i += 1;
                        }
                        '\'' => break,
                        other => text.push(other),
                    }
                }
                row.push(SqlValue::Text(text));
            } else {
                let start = i;
                while i < chars.len() && chars[i] != ',' && chars[i] != ')' {
                    i += 1;
                }
                let token: String = chars[start..i].iter().collect::<String>().trim().to_string();
                if token.eq_ignore_ascii_case("NULL") {
                    row.push(SqlValue::Null);
                } else if let Some(hex) = token.strip_prefix("0x") {
                    let bytes = (0..hex.len())
                        .step_by(2)
                        .map(|k| u8::from_str_radix(&hex[k..k + 2], 16))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|_| bad("bad hex literal"))?;
                    row.push(SqlValue::Bytes(bytes));
                } else {
                    row.push(SqlValue::Number(token));
                }
            }
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            match chars.get(i) {
                Some(',') => i += 1,
                Some(')') => {
                    i += 1;
                    break;
                }
                _ => return Err(bad("expected , or )")),
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Settings rooted at `base` for a MySQL database called `shop`.
pub fn settings(base: &Path) -> Settings {
    Settings {
        database: DatabaseConnectionConfig {
            name: "shop".to_string(),
            user: "backup".to_string(),
            password: "secret".to_string(),
            host: "localhost".to_string(),
            port: 3306,
            engine: EngineType::Mysql,
        },
        charset: "utf8".to_string(),
        collation: "utf8_bin".to_string(),
        base_dir: base.to_path_buf(),
        memory_limit: "-1".to_string(),
    }
}

/// Three tables with a few awkward values.
pub fn seed_shop(server: &MemoryServer) {
    server.create_table("clientes", "`id` int NOT NULL,\n  `nombre` varchar(100)", "utf8");
    server.create_table("facturas", "`id` int NOT NULL,\n  `total` decimal(10,2)", "utf8");
    server.create_table("adjuntos", "`id` int NOT NULL,\n  `data` blob", "utf8");
    for id in 1..=3 {
        server.insert(
            "clientes",
            vec![
                SqlValue::Number(id.to_string()),
                SqlValue::Text(format!("O'Cliente; {id}\nlinea")),
            ],
        );
    }
    server.insert(
        "facturas",
        vec![SqlValue::Number("1".into()), SqlValue::Number("12.50".into())],
    );
    server.insert("facturas", vec![SqlValue::Number("2".into()), SqlValue::Null]);
    server.insert(
        "adjuntos",
        vec![SqlValue::Number("1".into()), SqlValue::Bytes(vec![0, 1, 0xfe, 0xff])],
    );
}

#[derive(Debug, Default)]
pub struct CountingCache {
    pub cleared: Mutex<usize>,
}

impl CacheInvalidator for CountingCache {
    fn clear_all(&self) {
        *self.cleared.lock().unwrap() += 1;
    }
}

#[derive(Debug, Default)]
pub struct CountingSessions {
    pub cleared: Mutex<usize>,
}

impl SessionInvalidator for CountingSessions {
    fn clear_session_cookies(&self) {
        *self.cleared.lock().unwrap() += 1;
    }
}
