use std::collections::BTreeMap;
use std::fmt;

pub const RESTIC_REPOSITORY: &str = "RESTIC_REPOSITORY";
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
pub const RESTIC_PROGRESS_FPS: &str = "RESTIC_PROGRESS_FPS";
pub const TMPDIR: &str = "TMPDIR";
pub const CA_CERT_DATA: &str = "CA_CERT_DATA";

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";

pub const AZURE_ACCOUNT_NAME: &str = "AZURE_ACCOUNT_NAME";
pub const AZURE_ACCOUNT_KEY: &str = "AZURE_ACCOUNT_KEY";

pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const GOOGLE_PROJECT_ID: &str = "GOOGLE_PROJECT_ID";

pub const B2_ACCOUNT_ID: &str = "B2_ACCOUNT_ID";
pub const B2_ACCOUNT_KEY: &str = "B2_ACCOUNT_KEY";

/// Named bag of credential material, keyed like the variables it feeds.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}
