//! Workflow document
//!
//! Top level of a DSL 1.0.0 document: `document` metadata, optional
//! workflow-level `input`/`output`, the `use` catalogs, the root `do`
//! list, and an optional workflow `timeout`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::task::{
    ErrorDeclaration, InputClause, OutputClause, RetryDefinition, TaskList, TimeoutClause,
};

/// `document` metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// DSL version the document conforms to
    pub dsl: String,

    pub namespace: String,

    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Basic authentication credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuthentication {
    pub username: String,
    pub password: String,
}

/// Bearer token authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BearerAuthentication {
    pub token: String,
}

/// OAuth2 client-credentials authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Authentication {
    pub authority: String,

    #[serde(default)]
    pub grant: Option<String>,

    pub client: OAuth2Client,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// OAuth2 client credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Client {
    pub id: String,
    pub secret: String,
}

/// An authentication policy: exactly one scheme, or a reference to a
/// policy declared under `use.authentications`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthentication>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerAuthentication>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Authentication>,

    /// Name of a policy in `use.authentications`
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
}

/// Reusable declarations shared across the workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UseCatalog {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub authentications: IndexMap<String, AuthenticationPolicy>,

    /// Named error declarations referenced by `raise.error`
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub errors: IndexMap<String, ErrorDeclaration>,

    /// Named retry policies referenced by `try.catch.retry`
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub retries: IndexMap<String, RetryDefinition>,

    /// Names of secrets the workflow expects the runtime to supply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

/// A parsed workflow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub document: DocumentMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputClause>,

    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<UseCatalog>,

    #[serde(rename = "do")]
    pub do_: TaskList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputClause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutClause>,
}

impl WorkflowDocument {
    /// Parse from YAML or JSON source (YAML is a superset of JSON)
    pub fn parse(source: &str) -> Result<Self, DocumentParseError> {
        let doc: WorkflowDocument = serde_yaml::from_str(source)?;
        if doc.do_.is_empty() {
            return Err(DocumentParseError::EmptyDo);
        }
        Ok(doc)
    }

    /// Workflow name from the metadata block
    pub fn name(&self) -> &str {
        &self.document.name
    }

    /// Workflow version from the metadata block
    pub fn version(&self) -> &str {
        &self.document.version
    }

    /// Named error declaration from `use.errors`
    pub fn error_declaration(&self, name: &str) -> Option<&ErrorDeclaration> {
        self.use_.as_ref()?.errors.get(name)
    }

    /// Named retry policy from `use.retries`
    pub fn retry_definition(&self, name: &str) -> Option<&RetryDefinition> {
        self.use_.as_ref()?.retries.get(name)
    }

    /// Named authentication policy from `use.authentications`
    pub fn authentication(&self, name: &str) -> Option<&AuthenticationPolicy> {
        self.use_.as_ref()?.authentications.get(name)
    }
}

/// Document parse failures
#[derive(Debug, thiserror::Error)]
pub enum DocumentParseError {
    /// Not valid YAML/JSON or does not match the DSL shape
    #[error("malformed workflow document: {0}")]
    Syntax(#[from] serde_yaml::Error),

    /// The root `do` list is empty
    #[error("workflow document has an empty 'do' list")]
    EmptyDo,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: minimal
  version: "0.1.0"
do:
  - hello:
      set:
        greeting: world
"#;

    #[test]
    fn test_parse_minimal_yaml() {
        let doc = WorkflowDocument::parse(MINIMAL).unwrap();
        assert_eq!(doc.name(), "minimal");
        assert_eq!(doc.version(), "0.1.0");
        assert_eq!(doc.do_.len(), 1);
    }

    #[test]
    fn test_parse_json_form() {
        let json = r#"{
            "document": {"dsl": "1.0.0", "namespace": "tests", "name": "j", "version": "1.0.0"},
            "do": [{"a": {"set": {"x": 1}}}]
        }"#;
        let doc = WorkflowDocument::parse(json).unwrap();
        assert_eq!(doc.name(), "j");
    }

    #[test]
    fn test_empty_do_rejected() {
        let src = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: empty
  version: "0.1.0"
do: []
"#;
        assert!(matches!(
            WorkflowDocument::parse(src),
            Err(DocumentParseError::EmptyDo)
        ));
    }

    #[test]
    fn test_use_catalogs() {
        let src = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: catalogs
  version: "0.1.0"
use:
  errors:
    notImplemented:
      type: https://serverlessworkflow.io/spec/1.0.0/errors/runtime
      status: 500
  retries:
    transient:
      delay: PT1S
      backoff:
        exponential: {}
      limit:
        attempt:
          count: 3
  secrets:
    - apiKey
do:
  - noop:
      set:
        ok: true
"#;
        let doc = WorkflowDocument::parse(src).unwrap();
        assert!(doc.error_declaration("notImplemented").is_some());
        assert!(doc.retry_definition("transient").is_some());
        assert_eq!(doc.use_.as_ref().unwrap().secrets, vec!["apiKey"]);
    }
}
