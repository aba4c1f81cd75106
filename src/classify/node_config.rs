use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::Value;

use super::error::ClassifyError;

const ENVIRONMENT: &str = "environment";
const PARAMETERS: &str = "parameters";
const PRIMARY_ROLE: &str = "primary_role";
const DEFAULT_INDENT: usize = 2;

/// A node's classification document.
///
/// The original text is kept as is and edits are byte-range replacements of
/// the `environment` and `parameters.primary_role` values, so comments, key
/// order, line endings and unrelated keys survive untouched. `serde_yaml`
/// validates the document and renders replacement scalars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    pub node: String,
    pub environment: String,
    pub primary_role: String,
    #[serde(skip)]
    text: String,
}

// ---------------------------------------------------------------------------
// Layout: where the two managed values live in the text
// ---------------------------------------------------------------------------

/// Byte offsets of one line. `end` excludes the terminator, `next` is where
/// the following line starts.
#[derive(Debug, Clone, Copy)]
struct Line {
    start: usize,
    end: usize,
    next: usize,
}

#[derive(Debug, Clone)]
struct ScalarSpan {
    /// Bytes a new value replaces.
    value: Range<usize>,
    /// The key together with its value, whole lines.
    entry: Range<usize>,
    /// No value present; `value` is the gap after the colon.
    blank: bool,
    /// A comment follows the gap on the same line.
    trailing: bool,
}

#[derive(Debug, Clone)]
struct Block {
    header: Line,
    last_ix: usize,
    /// Last non-comment line belonging to the block.
    last: Line,
    indent: Option<usize>,
    entries: usize,
    primary_role: Option<ScalarSpan>,
}

#[derive(Debug, Clone)]
struct FlowEntry {
    range: Range<usize>,
    key: String,
    value: Option<Range<usize>>,
}

/// `{ ... }`, possibly over several lines.
#[derive(Debug, Clone)]
struct FlowMap {
    inner: Range<usize>,
    entries: Vec<FlowEntry>,
}

#[derive(Debug, Clone)]
enum Params {
    Block(Block),
    Flow(FlowMap),
    /// `parameters: ~` and friends.
    Null(Range<usize>),
}

#[derive(Debug)]
struct Layout {
    environment: Option<ScalarSpan>,
    parameters: Option<Params>,
}

fn split_lines(text: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    for chunk in text.split_inclusive('\n') {
        let next = start + chunk.len();
        let content = chunk
            .strip_suffix('\n')
            .map_or(chunk, |c| c.strip_suffix('\r').unwrap_or(c));
        lines.push(Line {
            start,
            end: start + content.len(),
            next,
        });
        start = next;
    }
    lines
}

fn line_str(text: &str, line: Line) -> &str {
    &text[line.start..line.end]
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_content(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn leading_ws(text: &str) -> usize {
    text.len() - text.trim_start().len()
}

/// Mapping key starting at byte `indent`, and the offset just past its colon.
fn key_at(line: &str, indent: usize) -> Option<(String, usize)> {
    let text = line.get(indent..)?;
    if text.is_empty() || text.starts_with(['#', '-', ' ', '\t']) || text.starts_with("...") {
        return None;
    }

    let (key, colon) = if let Some(quote) = text.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let close = text[1..].find(quote)? + 1;
        (text[1..close].to_owned(), close + 1)
    } else {
        let bytes = text.as_bytes();
        let colon = (0..bytes.len()).find(|&i| {
            bytes[i] == b':' && bytes.get(i + 1).is_none_or(|b| *b == b' ' || *b == b'\t')
        })?;
        (text[..colon].trim_end().to_owned(), colon)
    };

    if text.as_bytes().get(colon) != Some(&b':') {
        return None;
    }
    if text.as_bytes().get(colon + 1).is_some_and(|b| *b != b' ' && *b != b'\t') {
        return None;
    }
    Some((key, indent + colon + 1))
}

/// Step over anchors and tags ahead of a value. Returns where a missing value
/// would go and where the value itself starts.
fn skip_properties(text: &str, after_colon: usize, mut start: usize, line_end: usize) -> (usize, usize) {
    let mut gap = after_colon;
    while text[start..line_end].starts_with(['&', '!']) {
        let body = &text[start..line_end];
        let token = body.find([' ', '\t']).unwrap_or(body.len());
        gap = start + token;
        start = gap + leading_ws(&body[token..]);
    }
    (gap, start)
}

/// The next content line, when it is indented past `key_indent`.
fn continuation(text: &str, lines: &[Line], line_ix: usize, key_indent: usize) -> Option<usize> {
    let (ix, line) = lines
        .iter()
        .enumerate()
        .skip(line_ix + 1)
        .find(|(_, l)| is_content(line_str(text, **l)))?;
    (indent_of(line_str(text, *line)) > key_indent).then_some(ix)
}

/// End of a plain segment on one line, and whether a comment cut it short.
fn plain_segment(segment: &str, offset: usize) -> (usize, bool) {
    let cut = segment.find(" #").or_else(|| segment.find("\t#"));
    let body = cut.map_or(segment, |ix| &segment[..ix]);
    (offset + body.trim_end().len(), cut.is_some())
}

/// A plain scalar starting at `start`, folded over more-indented lines.
fn plain_end(text: &str, lines: &[Line], line_ix: usize, start: usize, key_indent: usize) -> usize {
    let (mut end, commented) = plain_segment(&text[start..lines[line_ix].end], start);
    if commented {
        return end;
    }
    for line in &lines[line_ix + 1..] {
        let s = line_str(text, *line);
        if s.trim().is_empty() {
            continue;
        }
        if indent_of(s) <= key_indent || s.trim_start().starts_with('#') {
            break;
        }
        let from = line.start + indent_of(s);
        let (segment_end, commented) = plain_segment(&text[from..line.end], from);
        end = segment_end;
        if commented {
            break;
        }
    }
    end
}

fn closing_double_quote(body: &str) -> Option<usize> {
    let mut escaped = false;
    for (ix, c) in body.char_indices().skip(1) {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Some(ix),
            _ => escaped = false,
        }
    }
    None
}

fn closing_single_quote(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut ix = 1;
    while ix < bytes.len() {
        if bytes[ix] == b'\'' {
            if bytes.get(ix + 1) == Some(&b'\'') {
                ix += 2;
                continue;
            }
            return Some(ix);
        }
        ix += 1;
    }
    None
}

/// Byte range of the scalar starting at `start` on line `line_ix`.
fn value_at(
    text: &str,
    lines: &[Line],
    line_ix: usize,
    start: usize,
    key_indent: usize,
) -> Result<Range<usize>, String> {
    let body = &text[start..lines[line_ix].end];
    let end = match body.chars().next() {
        Some('|' | '>') => {
            let mut end = start + body.split_whitespace().next().map_or(0, str::len);
            for line in &lines[line_ix + 1..] {
                let s = line_str(text, *line);
                if s.trim().is_empty() {
                    continue;
                }
                if indent_of(s) <= key_indent {
                    break;
                }
                end = line.end;
            }
            end
        }
        Some('"') => start + closing_double_quote(&text[start..]).ok_or("unterminated quoted value")? + 1,
        Some('\'') => start + closing_single_quote(&text[start..]).ok_or("unterminated quoted value")? + 1,
        Some('*') => start + body.find([' ', '\t']).unwrap_or(body.len()),
        Some('{' | '[') => return Err("expected a scalar value".into()),
        _ => plain_end(text, lines, line_ix, start, key_indent),
    };
    Ok(start..end)
}

fn scalar_span(
    text: &str,
    lines: &[Line],
    line_ix: usize,
    after_colon: usize,
    key_indent: usize,
) -> Result<ScalarSpan, String> {
    let line = lines[line_ix];
    let start = after_colon + leading_ws(&text[after_colon..line.end]);
    let (gap, start) = skip_properties(text, after_colon, start, line.end);
    let body = &text[start..line.end];

    let value = match body.chars().next() {
        None | Some('#') => match continuation(text, lines, line_ix, key_indent) {
            Some(next) => {
                let first = lines[next].start + indent_of(line_str(text, lines[next]));
                value_at(text, lines, next, first, key_indent)?
            }
            None => {
                return Ok(ScalarSpan {
                    value: gap..start,
                    entry: line.start..line.next,
                    blank: true,
                    trailing: !body.is_empty(),
                });
            }
        },
        _ => value_at(text, lines, line_ix, start, key_indent)?,
    };
    let last = lines
        .iter()
        .find(|l| l.end >= value.end)
        .copied()
        .unwrap_or(line);
    Ok(ScalarSpan {
        entry: line.start..last.next,
        value,
        blank: false,
        trailing: false,
    })
}

fn block_at(text: &str, lines: &[Line], header_ix: usize) -> Result<Block, String> {
    let mut block = Block {
        header: lines[header_ix],
        last_ix: header_ix,
        last: lines[header_ix],
        indent: None,
        entries: 0,
        primary_role: None,
    };
    for (ix, line) in lines.iter().enumerate().skip(header_ix + 1) {
        let s = line_str(text, *line);
        if !is_content(s) {
            continue;
        }
        let indent = indent_of(s);
        if indent == 0 {
            break;
        }
        let child_indent = *block.indent.get_or_insert(indent);
        if indent == child_indent
            && let Some((key, after)) = key_at(s, indent)
        {
            block.entries += 1;
            if key == PRIMARY_ROLE {
                block.primary_role = Some(scalar_span(text, lines, ix, line.start + after, indent)?);
            }
        }
        block.last_ix = ix;
        block.last = *line;
    }
    Ok(block)
}

fn trim_range(text: &str, range: Range<usize>) -> Range<usize> {
    let s = &text[range.clone()];
    let start = range.start + leading_ws(s);
    let end = range.start + s.trim_end().len();
    start..end.max(start)
}

fn flow_entry(text: &str, range: Range<usize>) -> Result<FlowEntry, String> {
    let s = &text[range.clone()];
    let (key, after_key) = match s.chars().next() {
        Some('"') => {
            let close = closing_double_quote(s).ok_or("unterminated quoted key")?;
            (s[1..close].to_owned(), close + 1)
        }
        Some('\'') => {
            let close = closing_single_quote(s).ok_or("unterminated quoted key")?;
            (s[1..close].to_owned(), close + 1)
        }
        _ => {
            let bytes = s.as_bytes();
            let colon = (0..bytes.len())
                .find(|&i| bytes[i] == b':' && bytes.get(i + 1).is_none_or(u8::is_ascii_whitespace))
                .unwrap_or(s.len());
            (s[..colon].trim_end().to_owned(), colon)
        }
    };
    let rest = &s[after_key..];
    let value = rest.trim_start().strip_prefix(':').map(|v| {
        let from = range.end - v.len();
        trim_range(text, from..range.end)
    });
    Ok(FlowEntry {
        range,
        key,
        value: value.filter(|v| !v.is_empty()),
    })
}

fn flow_map(text: &str, open: usize) -> Result<FlowMap, String> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut separators = Vec::new();
    let mut ix = open + 1;
    let close = loop {
        let Some(&b) = bytes.get(ix) else {
            return Err("unterminated flow mapping".into());
        };
        match b {
            b'"' => ix += closing_double_quote(&text[ix..]).ok_or("unterminated quoted value")?,
            b'\'' => ix += closing_single_quote(&text[ix..]).ok_or("unterminated quoted value")?,
            b'#' if bytes[ix - 1].is_ascii_whitespace() => {
                ix += text[ix..].find('\n').unwrap_or(text.len() - ix);
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' if depth > 0 => depth -= 1,
            b'}' => break ix,
            b',' if depth == 0 => separators.push(ix),
            _ => {}
        }
        ix += 1;
    };

    let mut entries = Vec::new();
    let mut from = open + 1;
    for to in separators.into_iter().chain(std::iter::once(close)) {
        let range = trim_range(text, from..to);
        if !range.is_empty() {
            entries.push(flow_entry(text, range)?);
        }
        from = to + 1;
    }
    Ok(FlowMap {
        inner: open + 1..close,
        entries,
    })
}

fn params_at(text: &str, lines: &[Line], header_ix: usize, after_colon: usize) -> Result<Params, String> {
    let header = lines[header_ix];
    let start = after_colon + leading_ws(&text[after_colon..header.end]);
    let (_, start) = skip_properties(text, after_colon, start, header.end);
    let body = &text[start..header.end];
    match body.chars().next() {
        None | Some('#') => Ok(Params::Block(block_at(text, lines, header_ix)?)),
        Some('{') => Ok(Params::Flow(flow_map(text, start)?)),
        _ => {
            let token = body.split(" #").next().unwrap_or_default().trim_end();
            if matches!(token, "~" | "null" | "Null" | "NULL") {
                Ok(Params::Null(start..start + token.len()))
            } else {
                Err("expected a map under parameters".into())
            }
        }
    }
}

fn layout(text: &str) -> Result<Layout, String> {
    let lines = split_lines(text);
    let mut found = Layout {
        environment: None,
        parameters: None,
    };
    let mut ix = 0;
    while ix < lines.len() {
        let line = lines[ix];
        if let Some((key, after)) = key_at(line_str(text, line), 0) {
            match key.as_str() {
                ENVIRONMENT => {
                    found.environment = Some(scalar_span(text, &lines, ix, line.start + after, 0)?);
                }
                PARAMETERS => {
                    let params = params_at(text, &lines, ix, line.start + after)?;
                    if let Params::Block(block) = &params {
                        ix = block.last_ix;
                    }
                    found.parameters = Some(params);
                }
                _ => {}
            }
        }
        ix += 1;
    }
    Ok(found)
}

impl Params {
    fn has_role(&self) -> bool {
        match self {
            Self::Block(block) => block.primary_role.is_some(),
            Self::Flow(flow) => flow.entries.iter().any(|e| e.key == PRIMARY_ROLE),
            Self::Null(_) => false,
        }
    }
}

impl FlowMap {
    /// Bytes to delete so entry `ix` and one separator disappear.
    fn removal(&self, ix: usize) -> Range<usize> {
        let entry = &self.entries[ix];
        if self.entries.len() == 1 {
            self.inner.clone()
        } else if let Some(next) = self.entries.get(ix + 1) {
            entry.range.start..next.range.start
        } else {
            self.entries[ix - 1].range.end..entry.range.end
        }
    }
}

fn render_scalar(node: &str, value: &str) -> Result<String, ClassifyError> {
    if value.contains(['\n', '\r']) {
        return Err(ClassifyError::parse(node, "values must be a single line"));
    }
    serde_yaml::to_string(value)
        .map(|s| s.trim_end().to_owned())
        .map_err(|e| ClassifyError::parse(node, e.to_string()))
}

/// Flow context also reserves `,[]{}` in plain scalars.
fn render_flow_scalar(node: &str, value: &str) -> Result<String, ClassifyError> {
    let rendered = render_scalar(node, value)?;
    if rendered.starts_with(['"', '\'']) || !rendered.contains([',', '[', ']', '{', '}']) {
        return Ok(rendered);
    }
    serde_json::to_string(value).map_err(|e| ClassifyError::parse(node, e.to_string()))
}

fn scalar_text(value: Option<&Value>, key: &str) -> Result<String, String> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(format!("expected a scalar value for {key}")),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// `<nodes_dir>/<node>.yaml`, refusing names that would leave the directory.
pub fn node_file(nodes_dir: &Path, node: &str) -> Result<PathBuf, ClassifyError> {
    if node.is_empty() || node.starts_with('.') || node.contains(['/', '\\']) || node.contains("..")
    {
        return Err(ClassifyError::InvalidNode(node.to_owned()));
    }
    Ok(nodes_dir.join(format!("{node}.yaml")))
}

/// Read a node's classification. A missing file is an empty classification
/// when `missing_ok`.
#[tracing::instrument(skip(nodes_dir), err)]
pub async fn load(nodes_dir: &Path, node: &str, missing_ok: bool) -> Result<NodeConfig, ClassifyError> {
    let path = node_file(nodes_dir, node)?;
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !missing_ok {
                return Err(ClassifyError::NotFound {
                    node: node.to_owned(),
                    source: e,
                });
            }
            String::new()
        }
        Err(e) => {
            return Err(ClassifyError::Read {
                node: node.to_owned(),
                source: e,
            });
        }
    };
    NodeConfig::parse(node, &text)
}

impl NodeConfig {
    pub fn parse(node: &str, text: &str) -> Result<Self, ClassifyError> {
        let mut text = text.to_owned();

        let has_content = split_lines(&text).into_iter().any(|l| {
            let s = line_str(&text, l);
            is_content(s) && s.trim() != "---" && s.trim() != "..."
        });
        let value = if has_content {
            serde_yaml::from_str(&text).map_err(|e| ClassifyError::parse(node, e.to_string()))?
        } else {
            Value::Null
        };

        let mapping = match value {
            Value::Mapping(mapping) => mapping,
            Value::Null => serde_yaml::Mapping::new(),
            Value::Sequence(_) | Value::Tagged(_) => {
                return Err(ClassifyError::parse(node, "expected a top-level map"));
            }
            // A lone scalar carries nothing worth keeping.
            _ => {
                text.clear();
                serde_yaml::Mapping::new()
            }
        };

        let environment =
            scalar_text(mapping.get(ENVIRONMENT), ENVIRONMENT).map_err(|r| ClassifyError::parse(node, r))?;
        let (has_params, primary_role) = match mapping.get(PARAMETERS) {
            None | Some(Value::Null) => (false, String::new()),
            Some(Value::Mapping(params)) => (
                true,
                scalar_text(params.get(PRIMARY_ROLE), PRIMARY_ROLE)
                    .map_err(|r| ClassifyError::parse(node, r))?,
            ),
            Some(_) => return Err(ClassifyError::parse(node, "expected a map under parameters")),
        };

        let found = layout(&text).map_err(|r| ClassifyError::parse(node, r))?;
        let role_located = found.parameters.as_ref().is_some_and(Params::has_role);
        let role_declared = has_params
            && mapping
                .get(PARAMETERS)
                .and_then(|p| p.get(PRIMARY_ROLE))
                .is_some();
        if (mapping.contains_key(ENVIRONMENT) && found.environment.is_none())
            || (has_params && found.parameters.is_none())
            || (role_declared && !role_located)
        {
            return Err(ClassifyError::parse(node, "unsupported YAML layout"));
        }

        Ok(Self {
            node: node.to_owned(),
            environment,
            primary_role,
            text,
        })
    }

    /// Move the node to the requested classification. Returns one
    /// description per value that changed; empty means nothing to do.
    pub fn apply(&mut self, environment: &str, primary_role: &str) -> Result<Vec<String>, ClassifyError> {
        let mut changes = Vec::new();
        if self.environment != environment {
            changes.push(format!(
                "environment from '{}' to '{environment}'",
                self.environment
            ));
            self.set_environment(environment)?;
        }
        if self.primary_role != primary_role {
            changes.push(format!(
                "primary_role from '{}' to '{primary_role}'",
                self.primary_role
            ));
            self.set_primary_role(primary_role)?;
        }
        Ok(changes)
    }

    fn layout(&self) -> Result<Layout, ClassifyError> {
        layout(&self.text).map_err(|r| ClassifyError::parse(&self.node, r))
    }

    /// The document's own line terminator.
    fn newline(&self) -> &'static str {
        if self.text.contains("\r\n") { "\r\n" } else { "\n" }
    }

    fn replace_scalar(&mut self, span: &ScalarSpan, rendered: &str) {
        let value = match (span.blank, span.trailing) {
            (false, _) => rendered.to_owned(),
            (true, true) => format!(" {rendered} "),
            (true, false) => format!(" {rendered}"),
        };
        self.text.replace_range(span.value.clone(), &value);
    }

    fn insert_line_after(&mut self, line: Line, content: &str) {
        let nl = self.newline();
        if line.next == line.end {
            self.text.insert_str(line.end, &format!("{nl}{content}"));
        } else {
            self.text.insert_str(line.next, &format!("{content}{nl}"));
        }
    }

    fn append_line(&mut self, content: &str) {
        let nl = self.newline();
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push_str(nl);
        }
        self.text.push_str(content);
        self.text.push_str(nl);
    }

    fn set_environment(&mut self, environment: &str) -> Result<(), ClassifyError> {
        let rendered = render_scalar(&self.node, environment)?;
        match self.layout()?.environment {
            Some(span) => self.replace_scalar(&span, &rendered),
            None => self.append_line(&format!("{ENVIRONMENT}: {rendered}")),
        }
        self.environment = environment.to_owned();
        Ok(())
    }

    fn set_primary_role(&mut self, primary_role: &str) -> Result<(), ClassifyError> {
        let params = self.layout()?.parameters;

        if primary_role.is_empty() {
            match params {
                Some(Params::Block(block)) => {
                    if let Some(span) = &block.primary_role {
                        let range = if block.entries == 1 {
                            block.header.start..block.last.next
                        } else {
                            span.entry.clone()
                        };
                        self.text.replace_range(range, "");
                    }
                }
                Some(Params::Flow(flow)) => {
                    if let Some(ix) = flow.entries.iter().position(|e| e.key == PRIMARY_ROLE) {
                        self.text.replace_range(flow.removal(ix), "");
                    }
                }
                Some(Params::Null(_)) | None => {}
            }
            self.primary_role.clear();
            return Ok(());
        }

        let rendered = render_scalar(&self.node, primary_role)?;
        match params {
            Some(Params::Block(Block {
                primary_role: Some(span),
                ..
            })) => self.replace_scalar(&span, &rendered),
            Some(Params::Block(block)) => {
                let indent = " ".repeat(block.indent.unwrap_or(DEFAULT_INDENT));
                self.insert_line_after(block.last, &format!("{indent}{PRIMARY_ROLE}: {rendered}"));
            }
            Some(Params::Flow(flow)) => {
                let rendered = render_flow_scalar(&self.node, primary_role)?;
                let entry = format!("{PRIMARY_ROLE}: {rendered}");
                match flow.entries.iter().find(|e| e.key == PRIMARY_ROLE) {
                    Some(FlowEntry { value: Some(value), .. }) => {
                        self.text.replace_range(value.clone(), &rendered);
                    }
                    Some(existing) => self.text.replace_range(existing.range.clone(), &entry),
                    None => match flow.entries.last() {
                        Some(last) => self.text.insert_str(last.range.end, &format!(", {entry}")),
                        None => self.text.replace_range(flow.inner.clone(), &entry),
                    },
                }
            }
            Some(Params::Null(value)) => {
                let rendered = render_flow_scalar(&self.node, primary_role)?;
                self.text
                    .replace_range(value, &format!("{{{PRIMARY_ROLE}: {rendered}}}"));
            }
            None => {
                self.append_line(&format!("{PARAMETERS}:"));
                self.append_line(&format!(
                    "{}{PRIMARY_ROLE}: {rendered}",
                    " ".repeat(DEFAULT_INDENT)
                ));
            }
        }
        self.primary_role = primary_role.to_owned();
        Ok(())
    }

    /// The document as it should be written back.
    pub fn to_text(&self) -> String {
        self.text.clone()
    }
}
