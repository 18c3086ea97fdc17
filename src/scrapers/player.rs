//! Player statistics page extraction.
//!
//! Turns the markup of one player-statistics page into a
//! [`PlayerStatistics`]. The page is expected to carry:
//!
//! - a headline (`h1.data-header__headline-wrapper`) with the player's name
//! - a profile list item labelled "Position:" with the position text
//! - a `div.box` whose `h2` names the statistics section, holding a table
//!   with a header row, one body row per tournament and a totals footer
//!
//! Missing name, position, columns, cells or footer all degrade to empty or
//! zero values. Only a missing statistics box or table is reported as an
//! [`ExtractionError`]; the profile part of such a page is still available
//! through [`extract_player_profile`].

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

use crate::error::ExtractionError;
use crate::models::{
    Cards, PlayerProfile, PlayerStatistics, Role, RoleMetrics, SeasonLine, StatLine,
    Substitutions,
};
use crate::scrapers::columns::{Column, ColumnMap, RowCells};

const SECTION_HEADINGS: &[&str] = &["статистика выступлений", "performance", "stats", "leistungsdaten"];
const POSITION_LABELS: &[&str] = &["position:", "амплуа:", "hauptposition:"];
const GOALKEEPER_MARKERS: &[&str] = &["goalkeeper", "вратарь", "torwart"];

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static HEADLINE: Lazy<Selector> = Lazy::new(|| selector("h1.data-header__headline-wrapper"));
static LIST_ITEM: Lazy<Selector> = Lazy::new(|| selector("li"));
static HEADER_CONTENT: Lazy<Selector> = Lazy::new(|| selector("span.data-header__content"));
static BOX: Lazy<Selector> = Lazy::new(|| selector("div.box"));
static BOX_HEADING: Lazy<Selector> = Lazy::new(|| selector("h2"));
static TABLE: Lazy<Selector> = Lazy::new(|| selector("table"));
static HEADER_CELLS: Lazy<Selector> = Lazy::new(|| selector("thead tr th"));
static BODY_ROWS: Lazy<Selector> = Lazy::new(|| selector("tbody > tr"));
static FOOTER_ROW: Lazy<Selector> = Lazy::new(|| selector("tfoot tr"));
static CELL: Lazy<Selector> = Lazy::new(|| selector("td"));
static LINK: Lazy<Selector> = Lazy::new(|| selector("a"));

/// Extract statistics from a player page.
#[instrument(level = "debug", skip_all)]
pub fn extract_player_statistics(markup: &str) -> Result<PlayerStatistics, ExtractionError> {
    let document = Html::parse_document(markup);
    let PlayerProfile {
        name,
        position,
        role,
    } = profile(&document);

    let section = statistics_box(&document).ok_or(ExtractionError::MissingContainer)?;
    let table = section
        .select(&TABLE)
        .next()
        .ok_or(ExtractionError::MissingTable)?;

    let columns = ColumnMap::from_headers(table.select(&HEADER_CELLS));
    let seasons: Vec<SeasonLine> = table
        .select(&BODY_ROWS)
        .filter_map(|row| season_line(&row, &columns, role))
        .collect();
    let totals = table
        .select(&FOOTER_ROW)
        .next()
        .map(|row| stat_line(&RowCells::from_row(&row), &columns, role))
        .unwrap_or_else(|| StatLine::empty(role));

    debug!(
        %name,
        ?role,
        columns = columns.len(),
        seasons = seasons.len(),
        "Extracted player statistics"
    );
    Ok(PlayerStatistics {
        name,
        position,
        role,
        totals,
        seasons,
    })
}

/// Name, position and role only. Works on pages without a statistics box.
#[instrument(level = "debug", skip_all)]
pub fn extract_player_profile(markup: &str) -> PlayerProfile {
    profile(&Html::parse_document(markup))
}

fn profile(document: &Html) -> PlayerProfile {
    let position = player_position(document);
    PlayerProfile {
        name: player_name(document),
        role: resolve_role(&position),
        position,
    }
}

fn player_name(document: &Html) -> String {
    document
        .select(&HEADLINE)
        .next()
        .map(|headline| {
            headline
                .text()
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn player_position(document: &Html) -> String {
    document
        .select(&LIST_ITEM)
        .filter(|item| {
            let text = item.text().collect::<String>().to_lowercase();
            POSITION_LABELS.iter().any(|label| text.contains(label))
        })
        .find_map(|item| item.select(&HEADER_CONTENT).next())
        .map(|content| content.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Goalkeeper if the position says so, outfield otherwise.
pub fn resolve_role(position: &str) -> Role {
    let position = position.to_lowercase();
    if GOALKEEPER_MARKERS.iter().any(|marker| position.contains(marker)) {
        Role::Goalkeeper
    } else {
        Role::Outfield
    }
}

fn statistics_box(document: &Html) -> Option<ElementRef<'_>> {
    document.select(&BOX).find(|section| {
        section.select(&BOX_HEADING).any(|heading| {
            let text = heading.text().collect::<String>().to_lowercase();
            SECTION_HEADINGS.iter().any(|wanted| text.contains(wanted))
        })
    })
}

fn season_line(row: &ElementRef, columns: &ColumnMap, role: Role) -> Option<SeasonLine> {
    let tournament = row
        .select(&CELL)
        .nth(1)
        .and_then(|cell| cell.select(&LINK).next())
        .map(|link| link.text().collect::<String>().trim().to_string())
        .filter(|name| !name.is_empty())?;
    Some(SeasonLine {
        tournament,
        line: stat_line(&RowCells::from_row(row), columns, role),
    })
}

fn stat_line(cells: &RowCells, columns: &ColumnMap, role: Role) -> StatLine {
    let metrics = match role {
        Role::Outfield => RoleMetrics::Outfield {
            goals: cells.count(columns, Column::Goals),
            assists: cells.count(columns, Column::Assists),
        },
        Role::Goalkeeper => RoleMetrics::Goalkeeper {
            goals_conceded: cells.count(columns, Column::GoalsConceded),
            clean_sheets: cells.count(columns, Column::CleanSheets),
        },
    };
    StatLine {
        matches: cells.count(columns, Column::Matches),
        minutes: cells.count(columns, Column::Minutes),
        cards: Cards {
            yellow: cells.count(columns, Column::YellowCards),
            second_yellow: cells.count(columns, Column::SecondYellowCards),
            red: cells.count(columns, Column::RedCards),
        },
        substitutions: Substitutions {
            on: cells.count(columns, Column::SubstitutionsOn),
            off: cells.count(columns, Column::SubstitutionsOff),
        },
        own_goals: cells.count(columns, Column::OwnGoals),
        metrics,
    }
}
