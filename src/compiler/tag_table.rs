use super::ir::TagTableEntry;
use crate::tags::{TagBinding, TagKind};

const WORD_STRIDE: u32 = 100;

/// Allocates addresses in discovery order.
///
/// Bools pack eight to a byte (`%M0.0`..`%M0.7`, then `%M1.0`). Int and Time
/// signals share one counter and land on successive hundred-multiples.
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    entries: Vec<TagTableEntry>,
    bits: u32,
    words: u32,
}

impl TagTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `name` unless already present. Returns its address.
    pub fn push(&mut self, name: &str, kind: TagKind) -> String {
        if let Some(existing) = self.entries.iter().find(|e| e.physical == name) {
            return existing.address.clone();
        }
        let address = match kind {
            TagKind::Bool => {
                let address = format!("%M{}.{}", self.bits / 8, self.bits % 8);
                self.bits += 1;
                address
            }
            TagKind::Int => {
                self.words += 1;
                format!("%MW{}", self.words * WORD_STRIDE)
            }
            TagKind::Time => {
                self.words += 1;
                format!("%MD{}", self.words * WORD_STRIDE)
            }
        };
        self.entries.push(TagTableEntry {
            physical: name.to_string(),
            kind,
            address: address.clone(),
        });
        address
    }

    /// Allocate every binding in order.
    pub fn extend(&mut self, bindings: &[TagBinding]) {
        for binding in bindings {
            self.push(&binding.physical, binding.role.kind());
        }
    }

    /// Finished entries.
    pub fn into_entries(self) -> Vec<TagTableEntry> {
        self.entries
    }
}

/// Render entries as a tag-table XML document.
pub fn to_xml(name: &str, entries: &[TagTableEntry]) -> String {
    let mut xml = format!("<Tagtable name='{}'>\n", escape(name));
    for entry in entries {
        xml.push_str(&format!(
            "  <Tag type='{}' addr='{}'>{}</Tag>\n",
            entry.kind.as_str(),
            entry.address,
            escape(&entry.physical)
        ));
    }
    xml.push_str("</Tagtable>\n");
    xml
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
