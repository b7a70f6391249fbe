use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::config::ConfigError;

/// Subscriber channel identifiers for one notification batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecipientSet {
    recipients: Vec<String>,
}

impl RecipientSet {
    /// Blank and repeated entries are dropped, first occurrence wins.
    pub fn new(recipients: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(recipients.len());
        for r in recipients {
            let r = r.trim().to_string();
            if !r.is_empty() && !unique.contains(&r) {
                unique.push(r);
            }
        }
        Self { recipients: unique }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.recipients.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

/// Source of the current recipients, consulted once per batch so edits take
/// effect without a restart.
pub trait RecipientDirectory: Send + Sync {
    fn load(&self) -> Result<RecipientSet, ConfigError>;
}

#[derive(Debug, Deserialize)]
struct RecipientsFile {
    #[serde(default)]
    recipients: Vec<String>,
}

/// Reads `recipients:` from a YAML file. In test mode the file is ignored and
/// the test users are returned instead.
#[derive(Clone, Debug)]
pub struct FileRecipientDirectory {
    path: PathBuf,
    test_users: Option<Vec<String>>,
}

impl FileRecipientDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            test_users: None,
        }
    }

    pub fn with_test_users(mut self, test_users: Vec<String>) -> Self {
        self.test_users = Some(test_users);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecipientDirectory for FileRecipientDirectory {
    fn load(&self) -> Result<RecipientSet, ConfigError> {
        if let Some(test_users) = &self.test_users {
            return Ok(RecipientSet::new(test_users.clone()));
        }
        if !self.path.exists() {
            return Err(ConfigError::Missing(self.path.clone()));
        }
        let file: RecipientsFile = config::Config::builder()
            .add_source(config::File::from(self.path.as_path()).format(config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Ok(RecipientSet::new(file.recipients))
    }
}

/// A fixed recipient list.
#[derive(Clone, Debug, Default)]
pub struct StaticRecipients(pub RecipientSet);

impl RecipientDirectory for StaticRecipients {
    fn load(&self) -> Result<RecipientSet, ConfigError> {
        Ok(self.0.clone())
    }
}
