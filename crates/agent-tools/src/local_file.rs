//! Local File Tool
//!
//! Reads text-like files from disk. Progress for each file is streamed as a
//! scratchpad line; the last value is the `<files>` document.

use async_trait::async_trait;
use futures::StreamExt;
use std::fmt::Write as _;
use std::path::Path;

use agent_core::{ParamType, ParameterSchema, Result, Tool, ToolArgs, ToolDescriptor, ToolOutput};

/// Extensions read verbatim as UTF-8 text
pub const TEXT_EXTENSIONS: [&str; 11] = [
    "txt", "py", "md", "srt", "js", "jsx", "html", "css", "xml", "csv", "json",
];

const DESCRIPTION: &str = "Reads one or more local files and returns their contents. Provide one file per line.
Only read files of type <allowed_extensions></allowed_extensions>:
<allowed_extensions>
txt
py
md
srt
js
jsx
html
css
xml
csv
json
</allowed_extensions>

Do not attempt to read files outside the types described in the <allowed_extensions></allowed_extensions>.
Do not attempt to read files that are usually in binary format.";

/// `read_local_file` tool
pub struct LocalFileTool {
    descriptor: ToolDescriptor,
}

impl LocalFileTool {
    pub fn new() -> Self {
        let descriptor = ToolDescriptor::new("read_local_file", DESCRIPTION).param(
            ParameterSchema::required(
                "path",
                ParamType::String,
                "Local path of the file whose contents should be retrieved. Provide one file per line, e.g.:
file1.txt
subfolder/file2.md",
            ),
        );
        Self { descriptor }
    }
}

impl Default for LocalFileTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Contents of one supported file wrapped in `<contents>`
pub async fn extract_text(path: &Path) -> std::result::Result<String, String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
        return Err(format!("Unsupported file extension: .{extension}"));
    }

    let text = tokio::fs::read_to_string(path).await.map_err(|e| e.to_string())?;
    Ok(format!("<contents>\n{text}\n</contents>"))
}

/// Strip trailing whitespace from every line and end with a newline
fn normalize(document: &str) -> String {
    let mut out = String::with_capacity(document.len() + 1);
    for line in document.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[async_trait]
impl Tool for LocalFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, args: ToolArgs) -> Result<ToolOutput> {
        let paths: Vec<String> = args
            .str("path")
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();

        let values = async_stream::stream! {
            let mut document = String::from("<files>\n");
            for path in paths {
                let body = if Path::new(&path).is_file() {
                    yield format!("<scratchpad>Reading {path}</scratchpad>");
                    match extract_text(Path::new(&path)).await {
                        Ok(text) => text,
                        Err(e) => {
                            let message = format!("Error: Failed to process the file `{path}`: {e}");
                            yield format!("<scratchpad>{message}</scratchpad>");
                            format!("<error>\n{message}\n</error>")
                        }
                    }
                } else {
                    let message = format!("Error: Did not find file `{path}`");
                    yield format!("<scratchpad>{message}</scratchpad>");
                    format!("<error>\n{message}\n</error>")
                };

                let _ = write!(
                    document,
                    "<file>\n<file_name>{path}</file_name>\n{body}\n</file>\n"
                );
            }
            document.push_str("</files>");
            yield normalize(&document);
        };
        Ok(ToolOutput::Stream(values.boxed()))
    }
}
