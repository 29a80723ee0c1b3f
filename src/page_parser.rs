use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;

use crate::models::{Parity, RawCell, TimeRange};

static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("Invalid table selector"));
static HEADING: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("title, h1, h2, caption").expect("Invalid heading selector")
});

static TIME_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2})[:.](\d{2})\s*[-–—]\s*(\d{1,2})[:.](\d{2})")
        .expect("invalid regex: time range")
});
static PERIOD_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d{1,2})\s*(?:пара|п\.|\.|\))?$").expect("invalid regex: period number")
});
static PAGE_GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\D)(\d{3}\p{L}{0,2})(?:[^\p{L}\d]|$)").expect("invalid regex: page group")
});

const MAX_SPAN: usize = 16;

/// Default bell schedule: (period, start, end).
pub const BELL_SCHEDULE: [(u32, &str, &str); 6] = [
    (1, "09:00", "10:35"),
    (2, "10:50", "12:25"),
    (3, "13:30", "15:05"),
    (4, "15:20", "16:55"),
    (5, "17:05", "18:40"),
    (6, "18:55", "20:30"),
];

pub fn bell_time(period: u32) -> Option<TimeRange> {
    BELL_SCHEDULE
        .iter()
        .find(|(p, _, _)| *p == period)
        .map(|(_, start, end)| TimeRange::new(*start, *end))
}

fn bell_period(start: &str) -> Option<u32> {
    BELL_SCHEDULE
        .iter()
        .find(|(_, s, _)| *s == start)
        .map(|(p, _, _)| *p)
}

/// A parsed schedule page.
pub struct Page {
    url: String,
    document: Html,
    group: Option<String>,
}

impl Page {
    pub fn parse(url: &str, html: &str) -> Self {
        let document = Html::parse_document(html);
        let group = document
            .select(&HEADING)
            .map(|heading| heading.text().collect::<String>())
            .find_map(|text| {
                PAGE_GROUP
                    .captures(&text)
                    .map(|caps| caps[1].to_string())
            });

        debug!(url = %url, page_group = ?group, "Parsed page document");

        Self {
            url: url.to_string(),
            document,
            group,
        }
    }

    /// Group the whole page belongs to, taken from its headings.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Lazily walk every table on the page and yield its lesson cells.
    pub fn cells(&self) -> Cells<'_> {
        Cells {
            source: &self.url,
            page_group: self.group.as_deref(),
            tables: self.document.select(&TABLE),
            rows: Vec::new().into_iter(),
            state: TableState::default(),
            pending: VecDeque::new(),
        }
    }
}

pub struct Cells<'a> {
    source: &'a str,
    page_group: Option<&'a str>,
    tables: scraper::html::Select<'a, 'static>,
    rows: std::vec::IntoIter<ElementRef<'a>>,
    state: TableState,
    pending: VecDeque<RawCell>,
}

impl Iterator for Cells<'_> {
    type Item = RawCell;

    fn next(&mut self) -> Option<RawCell> {
        loop {
            if let Some(cell) = self.pending.pop_front() {
                return Some(cell);
            }

            if let Some(row) = self.rows.next() {
                self.state
                    .process_row(row, self.source, self.page_group, &mut self.pending);
                continue;
            }

            let table = self.tables.next()?;
            self.rows = table_rows(table).into_iter();
            self.state = TableState::default();
        }
    }
}

/// Rows that belong to `table` itself, not to tables nested in its cells.
fn table_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|el| el.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

/// A cell placed on the table grid.
struct PlacedCell {
    column: usize,
    colspan: usize,
    rowspan: usize,
    text: String,
    parity_hint: Option<Parity>,
}

/// A period cell whose `rowspan` still covers the rows below it.
#[derive(Clone)]
struct HeldPeriod {
    column: usize,
    first_lesson_column: usize,
    period: u32,
    time: Option<TimeRange>,
}

#[derive(Default)]
struct TableState {
    /// Grid column -> weekday, filled by a grid-layout header row.
    column_weekdays: Vec<Option<u8>>,
    /// Weekday set by a day-block heading row.
    current_weekday: Option<u8>,
    last_period: u32,
    held_period: Option<HeldPeriod>,
    /// Rows still covered by a `rowspan`, per grid column.
    carry: Vec<usize>,
    row_index: usize,
}

impl TableState {
    fn process_row(
        &mut self,
        row: ElementRef<'_>,
        source: &str,
        page_group: Option<&str>,
        out: &mut VecDeque<RawCell>,
    ) {
        let row_index = self.row_index;
        self.row_index += 1;

        // Sub-rows under a spanning period cell keep its period.
        let held = self
            .held_period
            .clone()
            .filter(|held| self.carry.get(held.column).is_some_and(|&rows| rows > 0));
        let placed = self.place_cells(row);
        if placed.iter().all(|cell| cell.text.is_empty()) {
            return;
        }

        let weekday_cells: Vec<(&PlacedCell, u8)> = placed
            .iter()
            .filter_map(|cell| parse_weekday(&cell.text).map(|day| (cell, day)))
            .collect();

        // Grid header: weekdays run across the columns.
        if weekday_cells.len() >= 2 {
            self.column_weekdays.clear();
            for (cell, day) in &weekday_cells {
                let end = cell.column + cell.colspan;
                if self.column_weekdays.len() < end {
                    self.column_weekdays.resize(end, None);
                }
                for slot in &mut self.column_weekdays[cell.column..end] {
                    *slot = Some(*day);
                }
            }
            self.last_period = 0;
            self.held_period = None;
            return;
        }

        // Day-block heading, either alone on its row or leading the row.
        if let Some((cell, day)) = weekday_cells.first() {
            let leftmost = placed.iter().find(|c| !c.text.is_empty());
            if leftmost.map(|c| c.column) == Some(cell.column) {
                self.current_weekday = Some(*day);
                self.last_period = 0;
            }
        }

        let content: Vec<&PlacedCell> = placed
            .iter()
            .filter(|cell| !cell.text.is_empty() && parse_weekday(&cell.text).is_none())
            .collect();
        if content.is_empty() {
            return;
        }

        let (period, time, first_lesson_column) = match content
            .first()
            .and_then(|cell| parse_period_cell(&cell.text).map(|parsed| (cell, parsed)))
        {
            Some((cell, (number, time))) => {
                let number = number
                    .or_else(|| time.as_ref().and_then(|t| bell_period(&t.start)))
                    .unwrap_or(self.last_period + 1);
                let first_lesson_column = cell.column + cell.colspan;
                if cell.rowspan > 1 {
                    self.held_period = Some(HeldPeriod {
                        column: cell.column,
                        first_lesson_column,
                        period: number,
                        time: time.clone(),
                    });
                }
                (number, time, first_lesson_column)
            }
            None => match held {
                Some(held) => (held.period, held.time, held.first_lesson_column),
                None => (self.last_period + 1, None, 1),
            },
        };
        self.last_period = period;

        for cell in content
            .into_iter()
            .filter(|cell| cell.column >= first_lesson_column)
        {
            let weekdays = self.weekdays_for(cell);
            if weekdays.is_empty() {
                debug!(
                    source = %source,
                    row = row_index,
                    column = cell.column,
                    "Cell has no weekday context, skipping"
                );
                continue;
            }

            out.push_back(RawCell {
                source: source.to_string(),
                row: row_index,
                column: cell.column,
                text: cell.text.clone(),
                weekdays,
                period,
                period_span: cell.rowspan as u32,
                time: time.clone(),
                parity_hint: cell.parity_hint,
                page_group: page_group.map(str::to_string),
            });
        }
    }

    /// Lay out the row's cells on the grid, skipping columns held by
    /// `rowspan` cells of earlier rows.
    fn place_cells(&mut self, row: ElementRef<'_>) -> Vec<PlacedCell> {
        let blocked: Vec<bool> = self.carry.iter().map(|&rows| rows > 0).collect();
        let mut placed = Vec::new();
        let mut column = 0;

        for cell in row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| matches!(el.value().name(), "td" | "th"))
        {
            while blocked.get(column).copied().unwrap_or(false) {
                column += 1;
            }

            let colspan = span_attr(cell, "colspan");
            let rowspan = span_attr(cell, "rowspan");
            placed.push(PlacedCell {
                column,
                colspan,
                rowspan,
                text: cell_text(cell),
                parity_hint: class_parity(cell),
            });
            column += colspan;
        }

        for (rows, was_blocked) in self.carry.iter_mut().zip(&blocked) {
            if *was_blocked {
                *rows -= 1;
            }
        }
        for cell in placed.iter().filter(|cell| cell.rowspan > 1) {
            let end = cell.column + cell.colspan;
            if self
                .held_period
                .as_ref()
                .is_some_and(|held| (cell.column..end).contains(&held.column))
            {
                self.held_period = None;
            }
            if self.carry.len() < end {
                self.carry.resize(end, 0);
            }
            for rows in &mut self.carry[cell.column..end] {
                *rows = cell.rowspan - 1;
            }
        }

        placed
    }

    fn weekdays_for(&self, cell: &PlacedCell) -> Vec<u8> {
        if self.column_weekdays.is_empty() {
            return self.current_weekday.into_iter().collect();
        }

        let mut days: Vec<u8> = (cell.column..cell.column + cell.colspan)
            .filter_map(|column| self.column_weekdays.get(column).copied().flatten())
            .collect();
        days.dedup();
        days
    }
}

fn span_attr(cell: ElementRef<'_>, name: &str) -> usize {
    cell.value()
        .attr(name)
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_SPAN)
}

fn class_parity(cell: ElementRef<'_>) -> Option<Parity> {
    cell.value().classes().find_map(|class| {
        let class = class.to_lowercase();
        if class.contains("upper") || class.contains("even") || class.contains("верх") {
            Some(Parity::Even)
        } else if class.contains("lower") || class.contains("odd") || class.contains("нижн") {
            Some(Parity::Odd)
        } else {
            None
        }
    })
}

/// Cell text with `<br>` and block boundaries turned into newlines and
/// whitespace collapsed within each line.
fn cell_text(cell: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in cell.descendants() {
        match node.value() {
            Node::Text(text) => raw.push_str(text),
            Node::Element(el) if el.name() == "br" => raw.push('\n'),
            Node::Element(el) if matches!(el.name(), "p" | "div" | "li") => raw.push('\n'),
            _ => {}
        }
    }

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a weekday heading (Monday = 0).
pub fn parse_weekday(text: &str) -> Option<u8> {
    const NAMES: [(&[&str], u8); 7] = [
        (&["понедельник", "пн", "monday", "mon"], 0),
        (&["вторник", "вт", "tuesday", "tue"], 1),
        (&["среда", "ср", "wednesday", "wed"], 2),
        (&["четверг", "чт", "thursday", "thu"], 3),
        (&["пятница", "пт", "friday", "fri"], 4),
        (&["суббота", "сб", "saturday", "sat"], 5),
        (&["воскресенье", "вс", "sunday", "sun"], 6),
    ];

    let text = text.trim().trim_end_matches(['.', ':']).to_lowercase();
    if text.is_empty() {
        return None;
    }

    NAMES
        .iter()
        .find(|(names, _)| names.contains(&text.as_str()))
        .map(|(_, day)| *day)
}

/// Parse a period/time cell: `"1"`, `"1 пара"`, `"9:00 - 10:35"` or both.
/// Returns `None` when the text is neither.
fn parse_period_cell(text: &str) -> Option<(Option<u32>, Option<TimeRange>)> {
    let text = text.replace('\n', " ");
    let time = TIME_RANGE.captures(&text).map(|caps| {
        TimeRange::new(
            format!("{:0>2}:{}", &caps[1], &caps[2]),
            format!("{:0>2}:{}", &caps[3], &caps[4]),
        )
    });

    let rest = TIME_RANGE.replace(&text, "");
    let rest = rest.trim();
    let number = PERIOD_NUMBER
        .captures(rest)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|n| *n > 0);

    if number.is_none() && time.is_none() {
        return None;
    }
    if number.is_none() && !rest.is_empty() {
        // Some other text next to a time: not a period cell.
        return None;
    }
    Some((number, time))
}
