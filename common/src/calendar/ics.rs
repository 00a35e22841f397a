// iCalendar content-line codec: unfolding, parameters, text escapes, components

use crate::errors::ParseError;

const PREAMBLE: &str = "BEGIN:VCALENDAR";

/// One `NAME;PARAM=VALUE:value` content line
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl Property {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Value with TEXT escapes resolved
    pub fn text(&self) -> String {
        unescape_text(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Component {
    pub name: String,
    pub properties: Vec<Property>,
    pub components: Vec<Component>,
}

impl Component {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            ..Self::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// All VEVENT components at any depth, in document order
    pub fn events(&self) -> Vec<&Component> {
        let mut events = Vec::new();
        collect_events(self, &mut events);
        events
    }
}

fn collect_events<'a>(component: &'a Component, out: &mut Vec<&'a Component>) {
    for child in &component.components {
        if child.name == "VEVENT" {
            out.push(child);
        }
        collect_events(child, out);
    }
}

/// Parsed document plus the problems tolerated while parsing it
#[derive(Debug, Default)]
pub struct ParsedCalendar {
    /// Synthetic root holding the top-level components
    pub root: Component,
    pub issues: Vec<ParseError>,
}

impl ParsedCalendar {
    pub fn events(&self) -> Vec<&Component> {
        self.root.events()
    }
}

/// Whether a response body is a calendar document
pub fn has_calendar_preamble(body: &str) -> bool {
    let trimmed = body.trim_start_matches('\u{feff}').trim_start();
    trimmed
        .get(..PREAMBLE.len())
        .map(|head| head.eq_ignore_ascii_case(PREAMBLE))
        .unwrap_or(false)
}

/// Whether a calendar body contains at least one event
pub fn has_events(body: &str) -> bool {
    unfold(body)
        .iter()
        .any(|(_, line)| line.trim().eq_ignore_ascii_case("BEGIN:VEVENT"))
}

/// Join folded lines; returns (first physical line number, logical line)
pub fn unfold(text: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (index, raw) in text.trim_start_matches('\u{feff}').lines().enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix([' ', '\t']) {
            if let Some((_, last)) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if raw.trim().is_empty() {
            continue;
        }
        lines.push((index + 1, raw.to_string()));
    }
    lines
}

/// Split one logical line into name, parameters and value
pub fn parse_content_line(line: &str) -> Option<Property> {
    let mut name_end = None;
    for (i, c) in line.char_indices() {
        if c == ';' || c == ':' {
            name_end = Some(i);
            break;
        }
    }
    let name_end = name_end?;
    let name = line[..name_end].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }

    let mut params = Vec::new();
    let mut rest = &line[name_end..];
    while let Some(after_semicolon) = rest.strip_prefix(';') {
        let eq = after_semicolon.find('=')?;
        let key = after_semicolon[..eq].trim().to_string();
        let value_part = &after_semicolon[eq + 1..];

        let (value, remainder) = if let Some(quoted) = value_part.strip_prefix('"') {
            let close = quoted.find('"')?;
            (quoted[..close].to_string(), &quoted[close + 1..])
        } else {
            let end = value_part.find([';', ':'])?;
            (value_part[..end].to_string(), &value_part[end..])
        };
        params.push((key, value));
        rest = remainder;
    }

    let value = rest.strip_prefix(':')?;
    Some(Property {
        name: name.to_ascii_uppercase(),
        params,
        value: value.to_string(),
    })
}

/// Lenient parse: malformed lines are skipped and reported, never fatal
pub fn parse(text: &str) -> ParsedCalendar {
    let mut issues = Vec::new();
    let mut stack: Vec<Component> = vec![Component::named("ROOT")];

    for (line_no, line) in unfold(text) {
        let Some(property) = parse_content_line(&line) else {
            issues.push(ParseError::MalformedLine {
                line: line_no,
                content: line.chars().take(80).collect(),
            });
            continue;
        };

        match property.name.as_str() {
            "BEGIN" => stack.push(Component::named(property.value.trim())),
            "END" => {
                let name = property.value.trim().to_ascii_uppercase();
                if stack.len() > 1 && stack.last().map(|c| c.name == name).unwrap_or(false) {
                    if let Some(done) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.components.push(done);
                        }
                    }
                } else {
                    issues.push(ParseError::MalformedLine {
                        line: line_no,
                        content: line.clone(),
                    });
                }
            }
            _ => {
                if let Some(current) = stack.last_mut() {
                    current.properties.push(property);
                }
            }
        }
    }

    // Close anything left open so truncated documents still yield their events
    while stack.len() > 1 {
        if let Some(open) = stack.pop() {
            issues.push(ParseError::UnterminatedComponent(open.name.clone()));
            if let Some(parent) = stack.last_mut() {
                parent.components.push(open);
            }
        }
    }

    ParsedCalendar {
        root: stack.pop().unwrap_or_default(),
        issues,
    }
}

/// Resolve TEXT value escapes (`\n`, `\,`, `\;`, `\\`)
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
