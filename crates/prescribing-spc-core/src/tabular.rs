//! Minimal CSV reading and writing helpers shared by ingest and export.

/// Escape a string for CSV output.
pub(crate) fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Split one CSV record into fields, honouring double-quoted fields.
pub(crate) fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            (c, _) => field.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(field);
    Ok(fields)
}

/// Header row with case-insensitive column lookup.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    names: Vec<String>,
}

impl Header {
    pub(crate) fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim_start_matches('\u{feff}');
        let names = split_record(line)?
            .into_iter()
            .map(|n| n.trim().to_string())
            .collect();
        Ok(Self { names })
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name.trim()))
    }
}

/// Trimmed field value, `None` for blank or NA-style cells.
pub(crate) fn non_blank(field: Option<&String>) -> Option<&str> {
    let value = field?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("na") || value.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escaping() {
        assert_eq!(escape_csv("simple"), "simple");
        assert_eq!(escape_csv("with,comma"), "\"with,comma\"");
        assert_eq!(escape_csv("with\"quote"), "\"with\"\"quote\"");
    }

    #[test]
    fn test_split_plain() {
        assert_eq!(split_record("a,b,,c").unwrap(), vec!["a", "b", "", "c"]);
    }

    #[test]
    fn test_split_quoted() {
        let fields = split_record("\"GREEN, LANE\",\"say \"\"hi\"\"\",3").unwrap();
        assert_eq!(fields, vec!["GREEN, LANE", "say \"hi\"", "3"]);
        assert!(split_record("\"open,1").is_err());
    }

    #[test]
    fn test_escape_then_split() {
        let original = vec!["A,1".to_string(), "plain".to_string(), "q\"x".to_string()];
        let line = original.iter().map(|f| escape_csv(f)).collect::<Vec<_>>().join(",");
        assert_eq!(split_record(&line).unwrap(), original);
    }

    #[test]
    fn test_header_lookup() {
        let header = Header::parse("\u{feff}PRACTICE_CODE, Month ,items").unwrap();
        assert_eq!(header.len(), 3);
        assert_eq!(header.index_of("practice_code"), Some(0));
        assert_eq!(header.index_of("month"), Some(1));
        assert_eq!(header.index_of("list_size"), None);
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(Some(&" 12 ".to_string())), Some("12"));
        assert_eq!(non_blank(Some(&"".to_string())), None);
        assert_eq!(non_blank(Some(&"NaN".to_string())), None);
        assert_eq!(non_blank(None), None);
    }
}
