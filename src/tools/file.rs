use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::errors::ApiError;
use super::{extract_arg, Tool, ToolOutput};

const MAX_READ_CHARS: usize = 10_000;

/// Read-only file access, confined to the configured documents root.
pub struct FileReadTool {
    root: PathBuf,
}

impl FileReadTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a text file from the documents directory. Input: the file path \
         relative to the documents root."
    }

    async fn invoke(&self, input: &str) -> Result<ToolOutput, ApiError> {
        let relative = extract_arg(input, &["path", "file"]);
        let path = resolve_within(&self.root, &relative)?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ApiError::Tool(format!("cannot read {}: {}", relative, e)))?;

        let clipped: String = content.chars().take(MAX_READ_CHARS).collect();
        let text = if clipped.len() < content.len() {
            format!("{}\n... (truncated)", clipped)
        } else {
            clipped
        };

        Ok(ToolOutput::text(text))
    }
}

/// List directory entries under the documents root.
pub struct FileListTool {
    root: PathBuf,
}

impl FileListTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for FileListTool {
    fn name(&self) -> &str {
        "file_list"
    }

    fn description(&self) -> &str {
        "List files in a directory under the documents root. Input: the \
         directory path relative to the documents root, or empty for the root."
    }

    async fn invoke(&self, input: &str) -> Result<ToolOutput, ApiError> {
        let relative = extract_arg(input, &["dir", "path"]);
        let dir = resolve_within(&self.root, &relative)?;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ApiError::Tool(format!("cannot list {}: {}", relative, e)))?;

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            names.push(if is_dir { format!("{}/", name) } else { name });
        }
        names.sort();

        if names.is_empty() {
            return Ok(ToolOutput::text("The directory is empty."));
        }

        let data = names.iter().map(|name| json!({ "name": name })).collect();
        Ok(ToolOutput {
            text: names.join("\n"),
            data: Some(data),
        })
    }
}

/// Join `relative` onto `root` and refuse anything that escapes it once
/// canonicalised.
fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, ApiError> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| ApiError::Tool(format!("documents root unavailable: {}", e)))?;

    let joined = if relative.is_empty() {
        canonical_root.clone()
    } else {
        canonical_root.join(relative)
    };

    let resolved = joined
        .canonicalize()
        .map_err(|e| ApiError::Tool(format!("no such path '{}': {}", relative, e)))?;

    if !resolved.starts_with(&canonical_root) {
        return Err(ApiError::Tool(format!(
            "path '{}' is outside the documents root",
            relative
        )));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sandbox() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lorebase-files-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("notes.txt"), "hello notes").unwrap();
        std::fs::write(dir.join("sub/inner.txt"), "inner").unwrap();
        dir
    }

    #[tokio::test]
    async fn read_inside_root() {
        let root = sandbox();
        let tool = FileReadTool::new(root);

        let output = tool.invoke("notes.txt").await.unwrap();
        assert_eq!(output.text, "hello notes");

        let output = tool.invoke(r#"{"path": "sub/inner.txt"}"#).await.unwrap();
        assert_eq!(output.text, "inner");
    }

    #[tokio::test]
    async fn traversal_outside_root_is_refused() {
        let root = sandbox();
        let tool = FileReadTool::new(root);

        let err = tool.invoke("../../etc/hostname").await.unwrap_err();
        assert!(matches!(err, ApiError::Tool(_)));
    }

    #[tokio::test]
    async fn list_shows_entries_sorted() {
        let root = sandbox();
        let tool = FileListTool::new(root);

        let output = tool.invoke("").await.unwrap();
        assert_eq!(output.text, "notes.txt\nsub/");
    }
}
