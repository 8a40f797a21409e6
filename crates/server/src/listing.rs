//! HTML directory index.

use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// `None` when the entry could not be stat'ed (dangling symlink, ...).
    pub is_dir: Option<bool>,
}

/// Entries of `dir`, sorted by name. Hidden entries are left out since
/// request paths may not contain them.
pub async fn read_entries(dir: &Path) -> std::io::Result<Vec<DirEntry>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        // follows symlinks
        let is_dir = tokio::fs::metadata(entry.path()).await.ok().map(|m| m.is_dir());
        entries.push(DirEntry { name, is_dir });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn render(title: &str, entries: &[DirEntry]) -> String {
    let mut html = String::from("<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>");
    html.push_str(&escape_html(title));
    html.push_str("</title></head><body><h1>");
    html.push_str(&escape_html(title));
    html.push_str("</h1><div style=\"display:flex;flex-direction:column\">");

    for entry in entries {
        match entry.is_dir {
            Some(is_dir) => {
                let slash = if is_dir { "/" } else { "" };
                html.push_str(&format!(
                    "<a href=\"{}{slash}\">{}{slash}</a>",
                    urlencoding::encode(&entry.name),
                    escape_html(&entry.name),
                ));
            }
            None => {
                html.push_str(&format!("<span>{}</span>", escape_html(&entry.name)));
            }
        }
    }

    html.push_str("</div></body></html>");
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
