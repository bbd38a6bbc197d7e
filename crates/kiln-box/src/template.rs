use kiln_core::{KilnError, Result};

/// Text with `{{SLOT}}` placeholders. Slot names are upper-case identifiers;
/// any other `{{` is copied through untouched. Values are inserted verbatim
/// and never re-scanned.
#[derive(Debug, Clone, Copy)]
pub struct Template {
    name: &'static str,
    source: &'static str,
}

impl Template {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fills every slot from `values`; a slot without a value is an error.
    pub fn render(&self, values: &[(&str, &str)]) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        let mut rest = self.source;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];

            let slot = after
                .find("}}")
                .map(|close| &after[..close])
                .filter(|name| is_slot_name(name));

            match slot {
                Some(name) => {
                    let value = values
                        .iter()
                        .find(|(key, _)| *key == name)
                        .map(|(_, value)| *value)
                        .ok_or_else(|| {
                            KilnError::Template(format!("{}: slot {} was not filled", self.name, name))
                        })?;
                    out.push_str(value);
                    rest = &after[name.len() + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after;
                }
            }
        }

        out.push_str(rest);
        Ok(out)
    }
}

fn is_slot_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit())
}
