//! Token databases: entries, lookup, domain selection, and a CSV loader.
//!
//! The detokenizer only needs [`TokenDatabase::lookup`]. [`Database`] is the in-memory
//! implementation used by the loaders and the auto-updater.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Domain used when none is given.
pub const DEFAULT_DOMAIN: &str = "";

/// File suffix picked up when a database source is a directory.
pub const DATABASE_SUFFIX: &str = ".csv";

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Invalid domain pattern {pattern:?}: {source}")]
    InvalidDomain {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One format string known for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedStringEntry {
    pub token: u32,
    pub string: String,
    pub domain: String,
    /// `None` while the string is still present in the firmware.
    pub date_removed: Option<NaiveDateTime>,
}

impl TokenizedStringEntry {
    pub fn new(token: u32, string: impl Into<String>) -> Self {
        TokenizedStringEntry {
            token,
            string: string.into(),
            domain: DEFAULT_DOMAIN.to_string(),
            date_removed: None,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn removed(mut self, date: NaiveDateTime) -> Self {
        self.date_removed = Some(date);
        self
    }
}

/// Lookup of candidate strings by domain and token.
pub trait TokenDatabase {
    /// All entries sharing `token` in `domain`; empty when unknown.
    fn lookup(&self, domain: &str, token: u32) -> &[TokenizedStringEntry];
}

/// In-memory database: `domain -> token -> [entry]`.
#[derive(Debug, Clone, Default)]
pub struct Database {
    domains: HashMap<String, HashMap<u32, Vec<TokenizedStringEntry>>>,
}

impl Database {
    pub fn new() -> Self {
        Database::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TokenizedStringEntry>) -> Self {
        let mut db = Database::new();
        for entry in entries {
            db.insert(entry);
        }
        db
    }

    /// Add an entry. An identical string already present under the same token and
    /// domain is replaced, keeping the later removal date (or none).
    pub fn insert(&mut self, entry: TokenizedStringEntry) {
        let bucket = self
            .domains
            .entry(entry.domain.clone())
            .or_default()
            .entry(entry.token)
            .or_default();
        match bucket.iter_mut().find(|e| e.string == entry.string) {
            Some(existing) => {
                existing.date_removed = match (existing.date_removed, entry.date_removed) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
            None => bucket.push(entry),
        }
    }

    pub fn merge(&mut self, other: &Database) {
        for entry in other.entries() {
            self.insert(entry.clone());
        }
    }

    /// Drop every domain the selector does not accept.
    pub fn retain_domains(&mut self, selector: &DomainSelector) {
        self.domains.retain(|domain, _| selector.matches(domain));
    }

    pub fn entries(&self) -> impl Iterator<Item = &TokenizedStringEntry> {
        self.domains.values().flat_map(|t| t.values()).flatten()
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.values().all(HashMap::is_empty)
    }
}

impl TokenDatabase for Database {
    fn lookup(&self, domain: &str, token: u32) -> &[TokenizedStringEntry] {
        self.domains
            .get(domain)
            .and_then(|tokens| tokens.get(&token))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl FromIterator<TokenizedStringEntry> for Database {
    fn from_iter<I: IntoIterator<Item = TokenizedStringEntry>>(iter: I) -> Self {
        Database::from_entries(iter)
    }
}

// ==================== Sources and domain selection ====================

/// Which domains a source contributes.
#[derive(Debug, Clone)]
pub enum DomainSelector {
    /// Only [`DEFAULT_DOMAIN`].
    Default,
    /// Domains whose whole name matches the pattern.
    Matching(Regex),
}

impl DomainSelector {
    pub fn pattern(pattern: &str) -> Result<DomainSelector, DatabaseError> {
        Regex::new(&format!("^(?:{})$", pattern))
            .map(DomainSelector::Matching)
            .map_err(|source| DatabaseError::InvalidDomain { pattern: pattern.to_string(), source })
    }

    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainSelector::Default => domain == DEFAULT_DOMAIN,
            DomainSelector::Matching(re) => re.is_match(domain),
        }
    }
}

/// A database location: `path` or `path#domain-regex`.
#[derive(Debug, Clone)]
pub struct DatabaseSource {
    pub path: PathBuf,
    pub domains: DomainSelector,
}

impl DatabaseSource {
    /// Parse `path[#domain-regex]`. Without `#` only the default domain is loaded;
    /// `#.*` loads every domain.
    pub fn parse(selector: &str) -> Result<DatabaseSource, DatabaseError> {
        match selector.split_once('#') {
            Some((path, pattern)) => Ok(DatabaseSource {
                path: PathBuf::from(path),
                domains: DomainSelector::pattern(pattern)?,
            }),
            None => Ok(DatabaseSource {
                path: PathBuf::from(selector),
                domains: DomainSelector::Default,
            }),
        }
    }
}

// ==================== Loading ====================

/// Reads a database from a file or directory.
pub trait DatabaseLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Database, DatabaseError>;
}

/// Loads the CSV format: `token,date_removed,domain,"string"`.
///
/// Tokens are 8 hex digits; `date_removed` is `YYYY-MM-DD` or blank. Rows with three
/// columns (`token,date_removed,"string"`) belong to the default domain. A directory loads
/// every file ending in [`DATABASE_SUFFIX`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvDatabaseLoader;

impl DatabaseLoader for CsvDatabaseLoader {
    fn load(&self, path: &Path) -> Result<Database, DatabaseError> {
        if path.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_database_suffix(p))
                .collect();
            files.sort();
            let mut db = Database::new();
            for file in files {
                db.merge(&self.load(&file)?);
            }
            return Ok(db);
        }
        let text = String::from_utf8(fs::read(path)?).map_err(|e| DatabaseError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let db = parse_csv_database(&text, path);
        debug!(path = %path.display(), entries = db.len(), "loaded token database");
        Ok(db)
    }
}

pub(crate) fn has_database_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(DATABASE_SUFFIX))
}

/// Build a database from CSV text, skipping rows that cannot be used.
pub fn parse_csv_database(text: &str, origin: &Path) -> Database {
    let mut db = Database::new();
    for (row, fields) in parse_csv_records(text).into_iter().enumerate() {
        match entry_from_record(&fields) {
            Ok(entry) => db.insert(entry),
            Err(reason) => warn!(
                path = %origin.display(),
                row = row + 1,
                reason = %reason,
                "skipping token database row"
            ),
        }
    }
    db
}

fn entry_from_record(fields: &[String]) -> Result<TokenizedStringEntry, String> {
    let (token, date, domain, string) = match fields {
        [token, date, string] => (token, date, DEFAULT_DOMAIN, string),
        [token, date, domain, string] => (token, date, domain.trim(), string),
        _ => return Err(format!("expected 3 or 4 columns, found {}", fields.len())),
    };
    let token = u32::from_str_radix(token.trim(), 16)
        .map_err(|e| format!("bad token {:?}: {}", token, e))?;
    let date = date.trim();
    let date_removed = if date.is_empty() {
        None
    } else {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| format!("bad date {:?}: {}", date, e))?;
        Some(day.and_time(chrono::NaiveTime::MIN))
    };
    Ok(TokenizedStringEntry {
        token,
        string: string.clone(),
        domain: domain.to_string(),
        date_removed,
    })
}

/// Split CSV text into records. Quoted fields may contain commas, newlines and `""`.
fn parse_csv_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                if !(fields.len() == 1 && fields[0].is_empty()) {
                    records.push(std::mem::take(&mut fields));
                }
                fields.clear();
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push(fields);
    }
    records
}
