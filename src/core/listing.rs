use std::cmp::Ordering;
use std::io::{self, Write};
use std::str::FromStr;

use crate::core::repo::RepositoryInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    /// Most recent commit first.
    Time,
    Name,
    /// Largest history first.
    Commits,
}

/// `[±]time|name|commits`; a leading `-` flips the natural order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub reverse: bool,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (reverse, field) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        let field = match field.to_ascii_lowercase().as_str() {
            "time" | "date" | "updated" => SortField::Time,
            "name" | "path" => SortField::Name,
            "commits" | "count" => SortField::Commits,
            other => {
                return Err(format!(
                    "unknown sort field '{other}' (allowed: [±]time|name|commits)"
                ))
            }
        };
        Ok(Self { field, reverse })
    }
}

impl SortKey {
    fn compare(&self, a: &RepositoryInfo, b: &RepositoryInfo) -> Ordering {
        let ordering = match self.field {
            SortField::Time => b.last_updated.cmp(&a.last_updated),
            SortField::Name => a.path.cmp(&b.path),
            SortField::Commits => b.commit_count.cmp(&a.commit_count),
        };
        if self.reverse {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

pub fn sort(infos: &mut [RepositoryInfo], key: SortKey) {
    infos.sort_by(|a, b| key.compare(a, b));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    All,
    Active,
    Inactive,
}

impl FromStr for StateFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "active" => Ok(Self::Active),
            "inactive" | "archived" => Ok(Self::Inactive),
            _ => Err(format!(
                "invalid --state value '{value}' (allowed: all|active|inactive)"
            )),
        }
    }
}

impl StateFilter {
    /// Repositories whose state was never checked always pass.
    pub fn admits(&self, active: Option<bool>) -> bool {
        match (self, active) {
            (StateFilter::Active, Some(active)) => active,
            (StateFilter::Inactive, Some(active)) => !active,
            _ => true,
        }
    }
}

pub fn state_label(active: bool) -> &'static str {
    if active {
        "active"
    } else {
        "inactive"
    }
}

/// Writes `infos` as a padded markdown table. Nothing is written for an empty list.
pub fn render_table(
    out: &mut dyn Write,
    infos: &[RepositoryInfo],
    show_state: bool,
) -> io::Result<()> {
    if infos.is_empty() {
        return Ok(());
    }

    let mut headers = vec!["Repository", "URL", "Branch", "Status"];
    if show_state {
        headers.push("State");
    }
    headers.extend(["Last Updated", "Commits"]);

    let rows: Vec<Vec<String>> = infos.iter().map(|info| table_row(info, show_state)).collect();
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(column, header)| {
            rows.iter()
                .map(|row| row[column].chars().count())
                .fold(header.len(), usize::max)
                + 2
        })
        .collect();

    let header_cells: Vec<String> = headers.iter().map(|header| header.to_string()).collect();
    write_row(out, &header_cells, &widths)?;
    let separator: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    write_row(out, &separator, &widths)?;
    for row in &rows {
        write_row(out, row, &widths)?;
    }
    Ok(())
}

fn table_row(info: &RepositoryInfo, show_state: bool) -> Vec<String> {
    let name = match &info.id {
        Some(id) => id.to_string(),
        None => info.path.display().to_string(),
    };
    let status = if info.is_clean { "clean" } else { "modified" };
    let mut row = vec![
        name,
        info.url.clone().unwrap_or_default(),
        info.branch.clone().unwrap_or_default(),
        status.to_string(),
    ];
    if show_state {
        row.push(info.active.map(state_label).unwrap_or_default().to_string());
    }
    row.push(
        info.last_updated
            .map(|updated| updated.date().to_string())
            .unwrap_or_default(),
    );
    row.push(info.commit_count.to_string());
    row
}

fn write_row(out: &mut dyn Write, cells: &[String], widths: &[usize]) -> io::Result<()> {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    writeln!(out, "| {} |", padded.join(" | "))
}
