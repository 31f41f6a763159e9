//! Board document model and the pure row rendering used by the patcher.
//!
//! The document mirrors the parts of the live page the sync layer touches:
//! one table body whose rows are addressed by a stable key. Rows carry a
//! flag for whether their interaction handlers are attached, since rows
//! cloned in from a fetched page arrive without them.

use crate::RouteStatus;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowView {
    pub status: RouteStatus,
    pub badge_class: String,
    pub icon: &'static str,
    pub label: &'static str,
}

pub fn render_row(status: RouteStatus) -> RowView {
    RowView {
        status,
        badge_class: format!("badge bg-{}", status.color()),
        icon: status.icon(),
        label: status.label(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowNode {
    pub key: String,
    pub cells: Vec<String>,
    pub view: Option<RowView>,
    pub listeners_attached: bool,
}

impl RowNode {
    pub fn new(key: impl Into<String>, cells: Vec<String>, status: Option<RouteStatus>) -> Self {
        Self {
            key: key.into(),
            cells,
            view: status.map(render_row),
            listeners_attached: false,
        }
    }

    pub fn status(&self) -> Option<RouteStatus> {
        self.view.as_ref().map(|view| view.status)
    }

    /// Copy of the row as it would come out of a fetched page: same content,
    /// no handlers.
    pub fn detached_clone(&self) -> Self {
        Self {
            listeners_attached: false,
            ..self.clone()
        }
    }
}

/// Writes `view` into the row. Returns false when the row already showed it,
/// so applying the same view twice is a no-op.
pub fn apply_view(row: &mut RowNode, view: &RowView) -> bool {
    if row.view.as_ref() == Some(view) {
        return false;
    }
    row.view = Some(view.clone());
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBody {
    pub id: String,
    pub rows: Vec<RowNode>,
}

impl TableBody {
    pub fn new(id: impl Into<String>, rows: Vec<RowNode>) -> Self {
        Self {
            id: id.into(),
            rows,
        }
    }

    pub fn row(&self, key: &str) -> Option<&RowNode> {
        self.rows.iter().find(|row| row.key == key)
    }

    pub fn row_mut(&mut self, key: &str) -> Option<&mut RowNode> {
        self.rows.iter_mut().find(|row| row.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opacity {
    Visible,
    Faded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    /// Row membership changed on the server.
    MembershipChanged,
    /// A delta arrived but the page has no table body to patch.
    TableMissing,
    /// A content refresh fetched a page without the expected table body.
    RefreshBodyMissing,
    /// The page fetch behind a content refresh failed.
    RefreshFailed,
    /// Asked for from the board itself.
    Requested,
}

impl ReloadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadReason::MembershipChanged => "membership_changed",
            ReloadReason::TableMissing => "table_missing",
            ReloadReason::RefreshBodyMissing => "refresh_body_missing",
            ReloadReason::RefreshFailed => "refresh_failed",
            ReloadReason::Requested => "requested",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDocument {
    body: Option<TableBody>,
    opacity: Opacity,
    reload: Option<ReloadReason>,
}

impl Default for BoardDocument {
    fn default() -> Self {
        Self {
            body: None,
            opacity: Opacity::Visible,
            reload: None,
        }
    }
}

impl BoardDocument {
    pub fn new(body: TableBody) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn body(&self) -> Option<&TableBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut TableBody> {
        self.body.as_mut()
    }

    pub fn rows(&self) -> &[RowNode] {
        self.body.as_ref().map(|body| body.rows.as_slice()).unwrap_or(&[])
    }

    pub fn opacity(&self) -> Opacity {
        self.opacity
    }

    pub fn request_reload(&mut self, reason: ReloadReason) {
        self.reload.get_or_insert(reason);
    }

    pub fn pending_reload(&self) -> Option<ReloadReason> {
        self.reload
    }

    pub fn take_reload(&mut self) -> Option<ReloadReason> {
        self.reload.take()
    }

    pub fn begin_fade(&mut self) {
        self.opacity = Opacity::Faded;
    }

    pub fn end_fade(&mut self) {
        self.opacity = Opacity::Visible;
    }

    /// Replaces the live rows with detached clones of `fresh`. Returns false
    /// when there is no body to swap into.
    pub fn swap_rows(&mut self, fresh: &[RowNode]) -> bool {
        let Some(body) = self.body.as_mut() else {
            return false;
        };
        body.rows = fresh.iter().map(RowNode::detached_clone).collect();
        true
    }

    /// Attaches handlers to every row missing them; returns how many were attached.
    pub fn attach_row_listeners(&mut self) -> usize {
        let Some(body) = self.body.as_mut() else {
            return 0;
        };
        let mut attached = 0;
        for row in body.rows.iter_mut().filter(|row| !row.listeners_attached) {
            row.listeners_attached = true;
            attached += 1;
        }
        attached
    }
}

pub fn render_table_body(id: &str, rows: &[RowNode]) -> String {
    let mut html = format!("<tbody id=\"{}\">\n", escape_html(id));
    for row in rows {
        html.push_str(&format!("<tr data-key=\"{}\"", escape_html(&row.key)));
        if let Some(view) = &row.view {
            html.push_str(&format!(" data-status=\"{}\"", view.status.as_str()));
        }
        html.push('>');
        for cell in &row.cells {
            html.push_str(&format!("<td>{}</td>", escape_html(cell)));
        }
        if let Some(view) = &row.view {
            html.push_str(&format!(
                "<td data-role=\"status\"><span class=\"{}\"><i class=\"fas {}\"></i> {}</span></td>",
                view.badge_class, view.icon, view.label
            ));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>");
    html
}

/// Finds `<tbody id="{id}">` in a rendered page and parses its rows.
/// Returns `None` when the page has no such body.
pub fn extract_table_body(html: &str, id: &str) -> Option<TableBody> {
    let pattern = format!(
        r#"(?s)<tbody\b[^>]*\bid="{}"[^>]*>(.*?)</tbody>"#,
        regex::escape(&escape_html(id))
    );
    let body_re = Regex::new(&pattern).ok()?;
    let inner = body_re.captures(html)?.get(1)?.as_str();

    let mut rows = Vec::new();
    for captures in row_re().captures_iter(inner) {
        let attrs = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let content = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        let Some(key) = attr_value(attrs, "data-key") else {
            continue;
        };
        let status = attr_value(attrs, "data-status").and_then(|raw| raw.parse().ok());
        let cells = cell_re()
            .captures_iter(content)
            .filter(|cell| {
                !cell
                    .get(1)
                    .map(|m| m.as_str().contains("data-role=\"status\""))
                    .unwrap_or(false)
            })
            .filter_map(|cell| cell.get(2))
            .map(|m| unescape_html(tag_re().replace_all(m.as_str(), "").trim()))
            .collect();
        rows.push(RowNode::new(key, cells, status));
    }
    Some(TableBody::new(id, rows))
}

fn row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tr\b([^>]*)>(.*?)</tr>").expect("valid regex"))
}

fn cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<td\b([^>]*)>(.*?)</td>").expect("valid regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"))
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = attrs.find(&needle)? + needle.len();
    let end = attrs[start..].find('"')? + start;
    Some(unescape_html(&attrs[start..end]))
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_html(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_row(key: &str, number: &str, status: RouteStatus) -> RowNode {
        RowNode::new(key, vec![number.to_string(), "North".to_string()], Some(status))
    }

    #[test]
    fn render_row_is_pure_function_of_status() {
        let view = render_row(RouteStatus::Arrived);
        assert_eq!(view.badge_class, "badge bg-warning");
        assert_eq!(view.icon, "fa-clock");
        assert_eq!(view.label, "Arrived");
        assert_eq!(view, render_row(RouteStatus::Arrived));
    }

    #[test]
    fn applying_same_view_twice_changes_nothing() {
        let mut row = route_row("r1", "12", RouteStatus::NotPresent);
        let view = render_row(RouteStatus::Ready);
        assert!(apply_view(&mut row, &view));
        let snapshot = row.clone();
        assert!(!apply_view(&mut row, &view));
        assert_eq!(row, snapshot);
    }

    #[test]
    fn table_body_round_trips_through_html() {
        let rows = vec![
            route_row("r1", "12", RouteStatus::Arrived),
            route_row("r<2>", "A & B", RouteStatus::Ready),
            RowNode::new("s1", vec!["Ada \"Lovelace\"".to_string()], None),
        ];
        let html = format!(
            "<html><body><table>{}</table></body></html>",
            render_table_body("routes-table-body", &rows)
        );
        let body = extract_table_body(&html, "routes-table-body").expect("body");
        assert_eq!(body.rows, rows);
    }

    #[test]
    fn extract_returns_none_without_matching_body() {
        let html = render_table_body("other-body", &[]);
        assert!(extract_table_body(&html, "routes-table-body").is_none());
        assert!(extract_table_body("<p>login</p>", "routes-table-body").is_none());
    }

    #[test]
    fn swap_detaches_listeners_until_reattached() {
        let mut row = route_row("r1", "12", RouteStatus::Arrived);
        row.listeners_attached = true;
        let mut doc = BoardDocument::new(TableBody::new("b", vec![row.clone()]));
        let fresh = vec![row.clone(), route_row("r2", "13", RouteStatus::Ready)];

        assert!(doc.swap_rows(&fresh));
        assert!(doc.rows().iter().all(|row| !row.listeners_attached));
        assert_eq!(doc.attach_row_listeners(), 2);
        assert_eq!(doc.attach_row_listeners(), 0);
        assert!(doc.rows().iter().all(|row| row.listeners_attached));
    }

    #[test]
    fn first_reload_reason_wins() {
        let mut doc = BoardDocument::default();
        doc.request_reload(ReloadReason::TableMissing);
        doc.request_reload(ReloadReason::MembershipChanged);
        assert_eq!(doc.take_reload(), Some(ReloadReason::TableMissing));
        assert_eq!(doc.take_reload(), None);
    }
}
