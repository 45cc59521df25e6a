//! Element selectors for find/wait tools
//!
//! Grammar: an optional role followed by any of `#id` and `[name="..."]`,
//! e.g. `button`, `#save`, `button[name="Save"]`, `textbox#editor`.

use std::fmt;

use thiserror::Error;

use super::ui::UiElement;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("Selector is empty")]
    Empty,

    #[error("Unexpected character '{ch}' at position {pos}")]
    Unexpected { ch: char, pos: usize },

    #[error("Unterminated attribute starting at position {0}")]
    Unterminated(usize),

    #[error("Unsupported attribute '{0}' (only 'name' is supported)")]
    UnknownAttribute(String),

    #[error("Duplicate {0} in selector")]
    Duplicate(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub role: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SelectorError::Empty);
        }

        let chars: Vec<char> = input.chars().collect();
        let mut selector = Selector::default();
        let mut pos = 0;

        let take_ident = |start: usize| -> (String, usize) {
            let mut end = start;
            while end < chars.len() && is_ident(chars[end]) {
                end += 1;
            }
            (chars[start..end].iter().collect(), end)
        };

        if is_ident(chars[0]) {
            let (role, end) = take_ident(0);
            selector.role = Some(role);
            pos = end;
        }

        while pos < chars.len() {
            match chars[pos] {
                '#' => {
                    let (id, end) = take_ident(pos + 1);
                    if id.is_empty() {
                        let ch = chars.get(pos + 1).copied().unwrap_or('#');
                        return Err(SelectorError::Unexpected { ch, pos: pos + 1 });
                    }
                    if selector.id.replace(id).is_some() {
                        return Err(SelectorError::Duplicate("id"));
                    }
                    pos = end;
                }
                '[' => {
                    let start = pos;
                    let (attr, end) = take_ident(pos + 1);
                    if attr != "name" {
                        return Err(SelectorError::UnknownAttribute(attr));
                    }
                    pos = end;
                    if chars.get(pos) != Some(&'=') {
                        return Err(SelectorError::Unterminated(start));
                    }
                    pos += 1;
                    let quote = match chars.get(pos) {
                        Some(q @ ('"' | '\'')) => *q,
                        Some(ch) => return Err(SelectorError::Unexpected { ch: *ch, pos }),
                        None => return Err(SelectorError::Unterminated(start)),
                    };
                    pos += 1;
                    let value_start = pos;
                    while pos < chars.len() && chars[pos] != quote {
                        pos += 1;
                    }
                    if pos >= chars.len() {
                        return Err(SelectorError::Unterminated(start));
                    }
                    let value: String = chars[value_start..pos].iter().collect();
                    pos += 1;
                    if chars.get(pos) != Some(&']') {
                        return Err(SelectorError::Unterminated(start));
                    }
                    pos += 1;
                    if selector.name.replace(value).is_some() {
                        return Err(SelectorError::Duplicate("name"));
                    }
                }
                ch => return Err(SelectorError::Unexpected { ch, pos }),
            }
        }

        Ok(selector)
    }

    pub fn matches(&self, element: &UiElement) -> bool {
        self.role.as_deref().is_none_or(|r| r.eq_ignore_ascii_case(&element.role))
            && self.id.as_deref().is_none_or(|id| id == element.id)
            && self.name.as_deref().is_none_or(|n| n == element.name)
    }

    /// Matching elements in depth-first document order.
    pub fn find_all<'a>(&self, root: &'a UiElement) -> Vec<&'a UiElement> {
        let mut found = Vec::new();
        let mut stack = vec![root];
        while let Some(element) = stack.pop() {
            if self.matches(element) {
                found.push(element);
            }
            stack.extend(element.children.iter().rev());
        }
        found
    }

    pub fn find_first<'a>(&self, root: &'a UiElement) -> Option<&'a UiElement> {
        self.find_all(root).into_iter().next()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(role) = &self.role {
            write!(f, "{}", role)?;
        }
        if let Some(id) = &self.id {
            write!(f, "#{}", id)?;
        }
        if let Some(name) = &self.name {
            write!(f, "[name=\"{}\"]", name)?;
        }
        Ok(())
    }
}
