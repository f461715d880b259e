use crate::cache::{record_columns, record_from_row};
use crate::error::AppError;
use crate::models::FolderPage;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;

pub const DEFAULT_PAGE_SIZE: u32 = 24;
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    Mtime,
    Rating,
    Created,
    Modified,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            SortKey::Name => "name COLLATE NOCASE",
            SortKey::Mtime => "mtime",
            SortKey::Rating => "rating",
            SortKey::Created => "created_at",
            SortKey::Modified => "modified_at",
        }
    }

    fn nullable(self) -> bool {
        !matches!(self, SortKey::Name)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter, sort and page parameters for listing folders.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FolderQuery {
    /// Case-insensitive substring matched against name and path.
    pub q: Option<String>,
    /// Every listed tag must be present on a folder.
    pub tags: Vec<String>,
    pub sort: SortKey,
    pub order: SortOrder,
    pub offset: u32,
    pub limit: u32,
}

impl Default for FolderQuery {
    fn default() -> Self {
        Self {
            q: None,
            tags: Vec::new(),
            sort: SortKey::default(),
            order: SortOrder::default(),
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl FolderQuery {
    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if let Some(q) = self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            args.push(SqlValue::Text(format!("%{}%", escape_like(&q.to_lowercase()))));
            let n = args.len();
            clauses.push(format!(
                "(LOWER(name) LIKE ?{n} ESCAPE '\\' OR LOWER(path) LIKE ?{n} ESCAPE '\\')"
            ));
        }

        for tag in self.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            args.push(SqlValue::Text(tag.to_string()));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(folder_index.tags) AS tag WHERE tag.value = ?{})",
                args.len()
            ));
        }

        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), args)
        }
    }

    fn order_clause(&self) -> String {
        let column = self.sort.column();
        let dir = self.order.keyword();
        let nulls_last = if self.sort.nullable() {
            format!("{} IS NULL, ", column.split(' ').next().unwrap_or(column))
        } else {
            String::new()
        };
        format!(
            " ORDER BY {}{} {}, name COLLATE NOCASE ASC, path ASC",
            nulls_last, column, dir
        )
    }
}

/// Runs `request` against the cache, returning one page plus the total match count.
pub fn run(conn: &Connection, request: &FolderQuery) -> Result<FolderPage, AppError> {
    let (where_sql, args) = request.where_clause();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM folder_index{}", where_sql),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let limit = request.limit.clamp(1, MAX_PAGE_SIZE);
    let mut page_args = args;
    page_args.push(SqlValue::Integer(i64::from(limit)));
    page_args.push(SqlValue::Integer(i64::from(request.offset)));
    let sql = format!(
        "SELECT {} FROM folder_index{}{} LIMIT ?{} OFFSET ?{}",
        record_columns(),
        where_sql,
        request.order_clause(),
        page_args.len() - 1,
        page_args.len()
    );

    log::debug!("Folder query: {} ({} args)", sql, page_args.len());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(page_args.iter()), record_from_row)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }

    Ok(FolderPage {
        items,
        total: total as u64,
    })
}
