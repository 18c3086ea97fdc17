//! Column lookup and cell parsing for statistics tables.
//!
//! The source site publishes the same table in several languages and
//! reorders or drops columns between page variants, so column positions are
//! never hard-coded. A [`ColumnMap`] is built once per page from the header
//! row and every lookup returns `Option<usize>`.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Selector};
use std::collections::HashMap;

/// Statistics columns the engine knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Matches,
    Minutes,
    Goals,
    Assists,
    OwnGoals,
    SubstitutionsOn,
    SubstitutionsOff,
    YellowCards,
    SecondYellowCards,
    RedCards,
    GoalsConceded,
    CleanSheets,
}

impl Column {
    /// Header labels (lowercase) under which this column is published.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Column::Matches => &["matches", "appearances", "матчи", "einsätze", "spiele"],
            Column::Minutes => &["minutes played", "minutes", "сыграно минут", "eingesetzte minuten", "minuten"],
            Column::Goals => &["goals", "голы", "tore"],
            Column::Assists => &["assists", "голевые передачи", "vorlagen"],
            Column::OwnGoals => &["own goals", "автоголы", "eigentore"],
            Column::SubstitutionsOn => &["substitutions on", "substituted on", "вышел на замену", "eingewechselt", "einwechslungen"],
            Column::SubstitutionsOff => &["substitutions off", "substituted off", "заменен", "ausgewechselt", "auswechslungen"],
            Column::YellowCards => &["yellow cards", "желтые карточки", "gelbe karten"],
            Column::SecondYellowCards => &["second yellow cards", "yellow/red cards", "желтые/красные карточки", "gelb-rote karten"],
            Column::RedCards => &["red cards", "красные карточки", "rote karten"],
            Column::GoalsConceded => &["goals conceded", "пропущенные голы", "gegentore"],
            Column::CleanSheets => &["clean sheets", "матчи без пропущенных голов", "zu-null-spiele"],
        }
    }
}

static TITLED: Lazy<Selector> = Lazy::new(|| Selector::parse("[title]").expect("valid selector"));

static GROUP_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s.,\u{a0}\u{202f}']").expect("valid regex"));

/// Header label → column index, built once per table.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    by_label: HashMap<String, usize>,
}

impl ColumnMap {
    /// Scan header cells in order. A header's accessibility title wins over
    /// its visible text; blank headers are skipped but still occupy an index.
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = ElementRef<'a>>) -> Self {
        let mut by_label = HashMap::new();
        for (index, header) in headers.into_iter().enumerate() {
            if let Some(label) = header_label(&header) {
                by_label.entry(label.to_lowercase()).or_insert(index);
            }
        }
        Self { by_label }
    }

    /// Same rules as [`ColumnMap::from_headers`] for plain labels.
    #[cfg(test)]
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut by_label = HashMap::new();
        for (index, label) in labels.iter().enumerate() {
            let label = label.as_ref().trim();
            if !label.is_empty() {
                by_label.entry(label.to_lowercase()).or_insert(index);
            }
        }
        Self { by_label }
    }

    pub fn index_of(&self, column: Column) -> Option<usize> {
        column
            .aliases()
            .iter()
            .find_map(|alias| self.by_label.get(*alias).copied())
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }
}

fn header_label(header: &ElementRef) -> Option<String> {
    let title = header.value().attr("title").or_else(|| {
        header
            .select(&TITLED)
            .find_map(|titled| titled.value().attr("title"))
    });
    let label = match title {
        Some(title) if !title.trim().is_empty() => title.trim().to_string(),
        _ => header.text().collect::<String>().trim().to_string(),
    };
    (!label.is_empty()).then_some(label)
}

/// Cells of one table row, in document order.
#[derive(Debug, Clone)]
pub struct RowCells {
    texts: Vec<String>,
}

impl RowCells {
    pub fn from_row(row: &ElementRef) -> Self {
        let texts = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|cell| matches!(cell.value().name(), "td" | "th"))
            .map(|cell| cell.text().collect::<Vec<_>>().join(" ").trim().to_string())
            .collect();
        Self { texts }
    }

    pub fn text(&self, index: Option<usize>) -> Option<&str> {
        index.and_then(|i| self.texts.get(i)).map(String::as_str)
    }

    /// Integer value of a column; absent column or cell reads as 0.
    pub fn count(&self, columns: &ColumnMap, column: Column) -> u32 {
        let raw = self.text(columns.index_of(column));
        if column == Column::Minutes {
            parse_minutes(raw)
        } else {
            parse_count(raw)
        }
    }
}

/// A dash means "not applicable" on the source site.
fn is_placeholder(value: &str) -> bool {
    matches!(value, "-" | "–" | "—")
}

/// Parse a counter cell. Blank, placeholder and unparsable values are 0.
pub fn parse_count(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return 0;
    };
    let value = raw.trim();
    if value.is_empty() || is_placeholder(value) {
        return 0;
    }
    GROUP_SEPARATORS
        .replace_all(value, "")
        .parse::<u32>()
        .unwrap_or(0)
}

/// Parse a minutes cell such as `1.234'`.
pub fn parse_minutes(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return 0;
    };
    let value = raw.trim().trim_end_matches(['\'', '’', '′']).trim_end();
    parse_count(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn test_parse_table() {
        assert_eq!(parse_minutes(Some("90'")), 90);
        assert_eq!(parse_count(Some("")), 0);
        assert_eq!(parse_count(Some("-")), 0);
        assert_eq!(parse_count(Some("3")), 3);
    }

    #[test]
    fn test_parse_count_edge_cases() {
        assert_eq!(parse_count(None), 0);
        assert_eq!(parse_count(Some("  12 ")), 12);
        assert_eq!(parse_count(Some("–")), 0);
        assert_eq!(parse_count(Some("n/a")), 0);
        assert_eq!(parse_count(Some("1,204")), 1204);
        assert_eq!(parse_count(Some("1.204")), 1204);
    }

    #[test]
    fn test_parse_minutes_locale_formats() {
        assert_eq!(parse_minutes(Some("1.234'")), 1234);
        assert_eq!(parse_minutes(Some("2\u{a0}015’")), 2015);
        assert_eq!(parse_minutes(Some("-")), 0);
        assert_eq!(parse_minutes(Some("")), 0);
    }

    #[test]
    fn test_column_map_uses_aliases_case_insensitively() {
        let map = ColumnMap::from_labels(&["", "Competition", "Матчи", "Goals", "MINUTES PLAYED"]);
        assert_eq!(map.index_of(Column::Matches), Some(2));
        assert_eq!(map.index_of(Column::Goals), Some(3));
        assert_eq!(map.index_of(Column::Minutes), Some(4));
        assert_eq!(map.index_of(Column::Assists), None);
    }

    #[test]
    fn test_header_title_beats_visible_text() {
        let html = Html::parse_fragment(
            r#"<table><thead><tr>
                <th>Season</th>
                <th title="Matches"><span>Apps</span></th>
                <th><span class="icon" title="Goals"></span></th>
                <th> Assists </th>
            </tr></thead></table>"#,
        );
        let selector = Selector::parse("thead th").unwrap();
        let map = ColumnMap::from_headers(html.select(&selector));

        assert_eq!(map.index_of(Column::Matches), Some(1));
        assert_eq!(map.index_of(Column::Goals), Some(2));
        assert_eq!(map.index_of(Column::Assists), Some(3));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_duplicate_labels_keep_first_column() {
        let html = Html::parse_fragment(
            r#"<table><thead><tr>
                <th>Competition</th><th>Goals</th><th>Matches</th><th title="Goals">G</th>
            </tr></thead></table>"#,
        );
        let selector = Selector::parse("thead th").unwrap();
        let from_markup = ColumnMap::from_headers(html.select(&selector));
        let from_labels = ColumnMap::from_labels(&["Competition", "Goals", "Matches", "goals"]);

        assert_eq!(from_markup.index_of(Column::Goals), Some(1));
        assert_eq!(from_labels.index_of(Column::Goals), Some(1));
        assert_eq!(from_markup.len(), from_labels.len());
    }

    #[test]
    fn test_missing_column_counts_as_zero() {
        let html = Html::parse_fragment(
            "<table><tbody><tr><td></td><td>Cup</td><td>5</td></tr></tbody></table>",
        );
        let selector = Selector::parse("tbody tr").unwrap();
        let row = html.select(&selector).next().unwrap();
        let cells = RowCells::from_row(&row);
        let map = ColumnMap::from_labels(&["", "Competition", "Goals"]);

        assert_eq!(cells.count(&map, Column::Goals), 5);
        assert_eq!(cells.count(&map, Column::Matches), 0);
        assert_eq!(cells.text(Some(10)), None);
    }
}
