use crate::error::{BridgeError, Result};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Where a document lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentScheme {
    File,
    Untitled,
    /// Collaboratively synchronized document (`remote:` or `datalayer:`).
    Remote,
}

/// Editor flavour, derived from the path extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    Notebook,
    RichText,
}

const EMPTY_NOTEBOOK: &str = r#"{"cells":[],"metadata":{},"nbformat":4,"nbformat_minor":5}"#;
const EMPTY_RICH_TEXT: &str = r#"{"root":{"children":[],"direction":null,"format":"","indent":0,"type":"root","version":1}}"#;

impl DocumentKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".ipynb") {
            Some(Self::Notebook)
        } else if lower.ends_with(".lexical") {
            Some(Self::RichText)
        } else {
            None
        }
    }

    /// Well-formed content for a document with nothing in it yet.
    pub fn empty_payload(self) -> Vec<u8> {
        match self {
            Self::Notebook => EMPTY_NOTEBOOK.as_bytes().to_vec(),
            Self::RichText => EMPTY_RICH_TEXT.as_bytes().to_vec(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notebook => "notebook",
            Self::RichText => "rich-text",
        }
    }
}

/// Parsed document URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentUri {
    url: Url,
}

impl DocumentUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim()).map_err(|error| {
            BridgeError::InvalidUri(format!("{raw}: {error}"))
        })?;
        let uri = Self { url };
        uri.scheme()?;
        Ok(uri)
    }

    pub fn from_file_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let url = Url::from_file_path(&path)
            .map_err(|()| BridgeError::InvalidUri(path.display().to_string()))?;
        Ok(Self { url })
    }

    pub fn scheme(&self) -> Result<DocumentScheme> {
        match self.url.scheme() {
            "file" => Ok(DocumentScheme::File),
            "untitled" => Ok(DocumentScheme::Untitled),
            "remote" | "datalayer" => Ok(DocumentScheme::Remote),
            other => Err(BridgeError::InvalidUri(format!(
                "unsupported scheme {other}: {}",
                self.url
            ))),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.scheme(), Ok(DocumentScheme::Remote))
    }

    pub fn kind(&self) -> Result<DocumentKind> {
        DocumentKind::from_path(self.url.path())
            .ok_or_else(|| BridgeError::UnsupportedKind(self.url.to_string()))
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn to_file_path(&self) -> Result<PathBuf> {
        self.url
            .to_file_path()
            .map_err(|()| BridgeError::InvalidUri(format!("not a file URI: {}", self.url)))
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
