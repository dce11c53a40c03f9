//! User Details Tool
//!
//! Per-user free-form notes, one text file per username. The dispatcher
//! injects the username; the model never supplies it.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use agent_core::{ParamType, ParameterSchema, Result, Tool, ToolArgs, ToolDescriptor, ToolOutput};

pub const DEFAULT_USER_INFO_DIR: &str = "user_info";

const NO_INFORMATION: &str = "No information available.";
const SAVED: &str = "User information saved successfully.";

const DESCRIPTION: &str = "Reads or writes relevant information about the user being assisted. Always READ before you WRITE. Before saving new data, show all the changes (before/after) to the user and ask for confirmation. Never save or replace information without first confirming with the user that the changes are correct. Use [] instead of <> when creating groups.

Always retrieve the existing information first so you don't forget to save important existing data. When saving, make sure to include all information still relevant, as shown below in <user_example></user_example>:

<user_example>
If the current user information is:

[user_info]
[name]Julian[/name]
[friends]Karlo, Joseph, Milly[/friends]
[/user_info]

And the user says: Joseph is not my friend. After confirmation, the user information should be updated to:

[user_info]
[name]Julian[/name]
[friends]Karlo, Milly[/friends]
[/user_info]

All previous relevant information has to be sent in the contents.
</user_example>";

/// `read_write_user_details` tool
pub struct UserDetailsTool {
    descriptor: ToolDescriptor,
    dir: PathBuf,
}

impl UserDetailsTool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let descriptor = ToolDescriptor::new("read_write_user_details", DESCRIPTION)
            .param(
                ParameterSchema::required(
                    "action",
                    ParamType::String,
                    "One of READ or WRITE, depending whether information about the user should be retrieved or written. Always READ before using WRITE to make sure important information isn't discarded.",
                )
                .with_enum(["READ", "WRITE"]),
            )
            .param(ParameterSchema::optional(
                "contents",
                ParamType::String,
                "If action=WRITE, content that will fully replace the relevant information about the user. Do not forget to write previous data that is still relevant",
            ))
            .with_username();
        Self {
            descriptor,
            dir: dir.into(),
        }
    }

    fn file_for(&self, username: Option<&str>) -> PathBuf {
        self.dir.join(format!("{}.txt", file_stem(username)))
    }
}

impl Default for UserDetailsTool {
    fn default() -> Self {
        Self::new(DEFAULT_USER_INFO_DIR)
    }
}

/// Username reduced to characters safe in a file name
fn file_stem(username: Option<&str>) -> String {
    let stem: String = username
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() { "unknown".into() } else { stem }
}

async fn read_notes(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(NO_INFORMATION.into()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Tool for UserDetailsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolOutput> {
        let path = self.file_for(args.username());
        debug!(path = %path.display(), action = ?args.str("action"), "User details");

        let text = match args.str("action") {
            Some("WRITE") => {
                tokio::fs::create_dir_all(&self.dir).await?;
                tokio::fs::write(&path, args.str("contents").unwrap_or_default()).await?;
                SAVED.to_string()
            }
            _ => read_notes(&path).await?,
        };
        Ok(ToolOutput::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::tool::ResultMode;
    use agent_core::{ToolDispatcher, ToolRegistry};
    use serde_json::{Map, Value, json};

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn dispatcher(dir: &Path, username: Option<&str>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(UserDetailsTool::new(dir));
        ToolDispatcher::new(registry).with_username(username.map(String::from))
    }

    #[test]
    fn test_file_stem_is_sanitized() {
        assert_eq!(file_stem(Some("ana")), "ana");
        assert_eq!(file_stem(Some("../etc/passwd")), "___etc_passwd");
        assert_eq!(file_stem(None), "unknown");
    }

    #[tokio::test]
    async fn test_read_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let result = dispatcher(dir.path(), Some("ana"))
            .invoke("read_write_user_details", args(json!({"action": "READ"})), ResultMode::ResultsOnly)
            .await;
        assert_eq!(result, NO_INFORMATION);
    }

    #[tokio::test]
    async fn test_write_then_read_is_scoped_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes");
        let ana = dispatcher(&notes, Some("ana"));

        let saved = ana
            .invoke(
                "read_write_user_details",
                args(json!({"action": "WRITE", "contents": "[name]Ana[/name]"})),
                ResultMode::ResultsOnly,
            )
            .await;
        assert_eq!(saved, SAVED);
        assert!(notes.join("ana.txt").exists());

        let read = ana
            .invoke("read_write_user_details", args(json!({"action": "READ"})), ResultMode::ResultsOnly)
            .await;
        assert_eq!(read, "[name]Ana[/name]");

        let other = dispatcher(&notes, Some("bob"))
            .invoke("read_write_user_details", args(json!({"action": "READ"})), ResultMode::ResultsOnly)
            .await;
        assert_eq!(other, NO_INFORMATION);
    }

    #[tokio::test]
    async fn test_model_supplied_username_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ana = dispatcher(dir.path(), Some("ana"));
        ana.invoke(
            "read_write_user_details",
            args(json!({"action": "WRITE", "contents": "secret", "username": "mallory"})),
            ResultMode::ResultsOnly,
        )
        .await;

        assert!(dir.path().join("ana.txt").exists());
        assert!(!dir.path().join("mallory.txt").exists());
    }
}
