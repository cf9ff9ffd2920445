//! Per-item export: body and attachment writers.
//!
//! Every written file gets a collision-resistant name (creation timestamp,
//! random token, truncated sanitized label) so concurrent exports of items
//! with equal subjects never clobber each other.

use crate::error::{MbxError, Result};
use crate::mailbox::{Attachment, MailItem};
use std::path::Path;
use tracing::{debug, warn};

/// Keep only the last 60 characters of a sanitized label, like the file
/// naming of the source system (prevents over-long filenames).
const LABEL_TAIL: usize = 60;

fn sanitize_label(label: &str) -> String {
    let cleaned = label.replace('/', "_");
    let chars: Vec<char> = cleaned.chars().collect();
    let start = chars.len().saturating_sub(LABEL_TAIL);
    chars[start..].iter().collect()
}

fn unique_name(item: &MailItem, label: &str) -> String {
    format!(
        "{}_{:016x}_{}",
        item.created.format("%Y%m%dT%H%M%S"),
        rand::random::<u64>(),
        sanitize_label(label)
    )
}

/// Scan a message body for inline image references (`cid:<name>@<token>`),
/// mostly logos in footers. The referenced names are skipped during
/// attachment export since the body file already accounts for them.
pub fn scan_inline_images(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 0;
    while let Some(found) = body[pos..].find("cid:") {
        let abs = pos + found;
        let rest = &body[abs..];
        let end = rest.find('"').unwrap_or(rest.len());
        // Format: cid:image001.jpg@01D1189A.A75327D0
        let cid = &rest[4..end.max(4)];
        if let Some(name) = cid.split('@').next() {
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
        pos = abs + end.max(4);
    }
    names
}

/// Write the item body to a uniquely named file in `dir`.
///
/// Returns the inline-image skip list for the subsequent attachment export.
pub fn export_item_body(dir: &Path, item: &MailItem) -> Result<Vec<String>> {
    let subject = item.subject.as_deref().unwrap_or("");
    let name = format!("body_{}.txt", unique_name(item, subject));
    std::fs::write(dir.join(name), &item.body)?;
    Ok(scan_inline_images(&item.body))
}

/// Export every attachment of `item` into `dir`.
///
/// Names on the skip list (and unnamed attachments) are counted but not
/// written. Empty or unwritable content is logged and skipped. An unknown
/// attachment kind is a hard error for the item.
pub fn export_attachments(dir: &Path, item: &MailItem, skip_list: &[String]) -> Result<u64> {
    let mut handled: u64 = 0;
    for attachment in &item.attachments {
        match attachment {
            Attachment::File { name, content } => {
                let Some(name) = name.as_deref() else {
                    // No name means no real attachment
                    handled += 1;
                    continue;
                };
                handled += 1;
                if skip_list.iter().any(|s| s == name) {
                    debug!(name, "Skipping inline attachment");
                    continue;
                }
                if content.is_empty() {
                    warn!(name, "Empty attachment content, skipping");
                    continue;
                }
                let path = dir.join(unique_name(item, name));
                if let Err(e) = std::fs::write(&path, content) {
                    warn!(name, error = %e, "Could not write file attachment");
                }
            }
            Attachment::Item {
                name,
                subject,
                body,
            } => {
                let Some(name) = name.as_deref() else {
                    handled += 1;
                    continue;
                };
                handled += 1;
                if skip_list.iter().any(|s| s == name) {
                    debug!(name, "Skipping inline attachment");
                    continue;
                }
                if subject.is_none() && body.is_none() {
                    warn!(name, "Nested item without subject or body, skipping");
                    continue;
                }
                let mut text = String::from(name);
                if let Some(subject) = subject {
                    text.push_str(subject);
                }
                if let Some(body) = body {
                    text.push_str(body);
                }
                let path = dir.join(format!("{}.txt", unique_name(item, name)));
                if let Err(e) = std::fs::write(&path, text) {
                    warn!(name, error = %e, "Could not write nested item attachment");
                }
            }
            Attachment::Unknown => {
                return Err(MbxError::Content(
                    "unknown attachment kind".to_string(),
                ));
            }
        }
    }
    debug_assert_eq!(handled, item.attachments.len() as u64);
    Ok(handled)
}

/// Export one item: body first, then attachments minus the inline images
/// the body already references. Returns the handled attachment count.
pub fn export_item(dir: &Path, item: &MailItem) -> Result<u64> {
    let skip_list = export_item_body(dir, item)?;
    export_attachments(dir, item, &skip_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn item_with(attachments: Vec<Attachment>) -> MailItem {
        MailItem {
            subject: Some("Quarterly / report".to_string()),
            body: "hello there".to_string(),
            created: Utc.with_ymd_and_hms(2015, 3, 1, 10, 0, 0).unwrap(),
            attachments,
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_body_written_with_sanitized_name() {
        let tmp = tempdir().unwrap();
        let item = item_with(vec![]);
        export_item_body(tmp.path(), &item).unwrap();
        let names = dir_entries(tmp.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("body_20150301T100000_"));
        assert!(names[0].contains("Quarterly _ report"));
        assert!(!names[0].contains('/'));
    }

    #[test]
    fn test_label_tail_is_sixty_chars() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_label(&long).chars().count(), 60);
    }

    #[test]
    fn test_scan_inline_images() {
        let body = r#"best regards <img src="cid:image001.jpg@01D1189A.A75327D0"> bye"#;
        assert_eq!(scan_inline_images(body), vec!["image001.jpg"]);
    }

    #[test]
    fn test_scan_inline_images_multiple_and_unterminated() {
        let body = r#"a "cid:one.png@X" b "cid:two.gif@Y" trailing cid:"#;
        assert_eq!(scan_inline_images(body), vec!["one.png", "two.gif"]);
    }

    #[test]
    fn test_file_attachment_written() {
        let tmp = tempdir().unwrap();
        let item = item_with(vec![Attachment::File {
            name: Some("a.pdf".to_string()),
            content: vec![1, 2, 3],
        }]);
        let count = export_attachments(tmp.path(), &item, &[]).unwrap();
        assert_eq!(count, 1);
        assert_eq!(dir_entries(tmp.path()).len(), 1);
    }

    #[test]
    fn test_skip_listed_attachment_counted_not_written() {
        let tmp = tempdir().unwrap();
        let item = item_with(vec![Attachment::File {
            name: Some("image001.jpg".to_string()),
            content: vec![1, 2, 3],
        }]);
        let skip = vec!["image001.jpg".to_string()];
        let count = export_attachments(tmp.path(), &item, &skip).unwrap();
        assert_eq!(count, 1);
        assert!(dir_entries(tmp.path()).is_empty());
    }

    #[test]
    fn test_empty_file_attachment_skipped() {
        let tmp = tempdir().unwrap();
        let item = item_with(vec![Attachment::File {
            name: Some("empty.bin".to_string()),
            content: vec![],
        }]);
        let count = export_attachments(tmp.path(), &item, &[]).unwrap();
        assert_eq!(count, 1);
        assert!(dir_entries(tmp.path()).is_empty());
    }

    #[test]
    fn test_nested_item_attachment_written_as_text() {
        let tmp = tempdir().unwrap();
        let item = item_with(vec![Attachment::Item {
            name: Some("fwd".to_string()),
            subject: Some("FW: hello".to_string()),
            body: Some("forwarded body".to_string()),
        }]);
        let count = export_attachments(tmp.path(), &item, &[]).unwrap();
        assert_eq!(count, 1);
        let names = dir_entries(tmp.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".txt"));
        let text = std::fs::read_to_string(tmp.path().join(&names[0])).unwrap();
        assert!(text.contains("FW: hello"));
        assert!(text.contains("forwarded body"));
    }

    #[test]
    fn test_unknown_attachment_is_fatal_for_item() {
        let tmp = tempdir().unwrap();
        let item = item_with(vec![Attachment::Unknown]);
        let err = export_attachments(tmp.path(), &item, &[]).unwrap_err();
        assert!(matches!(err, MbxError::Content(_)));
    }

    #[test]
    fn test_export_item_skips_inline_images_referenced_by_body() {
        let tmp = tempdir().unwrap();
        let mut item = item_with(vec![Attachment::File {
            name: Some("logo.png".to_string()),
            content: vec![9, 9],
        }]);
        item.body = r#"footer <img src="cid:logo.png@ABC">"#.to_string();
        let count = export_item(tmp.path(), &item).unwrap();
        assert_eq!(count, 1);
        // Only the body file lands on disk
        let names = dir_entries(tmp.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("body_"));
    }
}
