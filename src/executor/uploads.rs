//! Renders the user's uploaded files into a text block for the model.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const MAX_FILE_SIZE: u64 = 1_000_000;
const MAX_PREVIEW_LINES: usize = 100;

fn separator() -> String {
    "=".repeat(50)
}

/// Formatted contents of every uploaded file, `None` when there are none.
pub async fn read_uploaded_files(paths: &[PathBuf]) -> Option<String> {
    if paths.is_empty() {
        return None;
    }

    let mut blocks = Vec::with_capacity(paths.len());
    for path in paths {
        blocks.push(render_file(path).await);
    }
    Some(blocks.join("\n"))
}

async fn render_file(path: &Path) -> String {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let sep = separator();

    match read_text(path).await {
        Ok(FileText::Full(content)) => {
            info!(
                "Successfully read file: {} ({} characters)",
                filename,
                content.chars().count()
            );
            format!("File: {}\n{}\n{}\n{}\n", filename, sep, content, sep)
        }
        Ok(FileText::Preview { content, size }) => {
            warn!(
                "File {} is large ({} bytes), showing preview only",
                filename,
                group_thousands(size)
            );
            format!(
                "File: {} ({} bytes - showing first {} lines)\n{}\n{}\n[... file continues for {} total bytes ...]\n{}\n",
                filename,
                group_thousands(size),
                MAX_PREVIEW_LINES,
                sep,
                content,
                group_thousands(size),
                sep
            )
        }
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            warn!("File {} appears to be binary, skipping content reading", filename);
            format!(
                "File: {}\n{}\n[Binary file - content not displayed]\n{}\n",
                filename, sep, sep
            )
        }
        Err(e) => {
            error!("Error reading file {}: {}", path.display(), e);
            format!(
                "File: {}\n{}\n[Error reading file: {}]\n{}\n",
                filename, sep, e, sep
            )
        }
    }
}

enum FileText {
    Full(String),
    Preview { content: String, size: u64 },
}

async fn read_text(path: &Path) -> std::io::Result<FileText> {
    let size = fs::metadata(path).await?.len();
    if size <= MAX_FILE_SIZE {
        let bytes = fs::read(path).await?;
        let content = String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        return Ok(FileText::Full(content));
    }

    let mut reader = BufReader::new(fs::File::open(path).await?);
    let mut content = String::new();
    for _ in 0..MAX_PREVIEW_LINES {
        // read_line fails with InvalidData on non UTF-8 input
        if reader.read_line(&mut content).await? == 0 {
            break;
        }
    }
    Ok(FileText::Preview { content, size })
}

/// `1234567` -> `1,234,567`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}
