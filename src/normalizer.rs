use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::models::{LessonRecord, Parity, RawCell};
use crate::page_parser::bell_time;

static PARITY_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(верхн(?:яя|ей|ие|их)|верх\.|upper|even|ч[её]тн(?:ая|ой|ые|ых|ый)|ч[её]т\.)|(нижн(?:яя|ей|ие|их)|ниж\.|lower|odd|неч[её]тн(?:ая|ой|ые|ых|ый)|неч[её]т\.))(?:\s+(?:нед(?:еля|\.)?|week))?$",
    )
    .expect("invalid regex: parity marker")
});
static GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:группа|гр\.?)?\s*(\d{3}\S*)$").expect("invalid regex: group")
});
static PLACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:ауд|аудитория|каф|кафедра|лаб|лаборатория|корп|корпус|зал|цфа|сфа|юфа|онлайн|online|дистант|дистанционно)(?:[\s.\d№\-]|$)|\d{1,2}-\d{2,3}\p{L}?$)",
    )
    .expect("invalid regex: place")
});
static TEACHER_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:проф|доц|ст\.\s?преп|преп|асс|акад)\.?\s+)+")
        .expect("invalid regex: teacher title")
});
static TEACHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\p{Lu}\p{Ll}+(?:-\p{Lu}\p{Ll}+)?\s+\p{Lu}\.\s?(?:\p{Lu}\.?)?|\p{Lu}\.\s?(?:\p{Lu}\.)?\s?\p{Lu}\p{Ll}+(?:-\p{Lu}\p{Ll}+)?)$",
    )
    .expect("invalid regex: teacher")
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Parity(Parity),
    Group(String),
    Place(String),
    Teacher(String),
    Text(String),
}

fn classify(token: &str) -> Token {
    if let Some(caps) = PARITY_MARKER.captures(token) {
        return if caps.get(1).is_some() {
            Token::Parity(Parity::Even)
        } else {
            Token::Parity(Parity::Odd)
        };
    }
    if let Some(caps) = GROUP.captures(token) {
        return Token::Group(caps[1].to_string());
    }
    if PLACE.is_match(token) {
        return Token::Place(token.to_string());
    }
    let name = TEACHER_TITLE.replace(token, "");
    if TEACHER.is_match(&name) {
        return Token::Teacher(name.trim().to_string());
    }
    Token::Text(token.to_string())
}

fn clean(token: &str) -> &str {
    let token = token.trim();
    match token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        Some(inner) => inner.trim(),
        None => token,
    }
}

/// Split one line into classified tokens. Slash-separated lists are split
/// only when every part is a teacher, group, place or parity marker.
fn tokenize(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for piece in line.split(',').map(clean).filter(|t| !t.is_empty()) {
        if piece.contains('/') {
            let parts: Vec<Token> = piece
                .split('/')
                .map(clean)
                .filter(|t| !t.is_empty())
                .map(classify)
                .collect();
            if !parts.iter().any(|t| matches!(t, Token::Text(_))) {
                tokens.extend(parts);
                continue;
            }
        }
        tokens.push(classify(piece));
    }
    tokens
}

/// A lesson being assembled from one or more lines of a cell.
#[derive(Default)]
struct Draft {
    subject: Vec<String>,
    teachers: Vec<String>,
    groups: Vec<String>,
    places: Vec<String>,
    parity: Option<Parity>,
}

impl Draft {
    fn absorb(&mut self, tokens: Vec<Token>) {
        for token in tokens {
            match token {
                Token::Parity(p) => {
                    self.parity = Some(self.parity.map_or(p, |current| current.combine(p)));
                }
                Token::Group(g) => push_unique(&mut self.groups, g),
                Token::Place(p) => push_unique(&mut self.places, p),
                Token::Teacher(t) => push_unique(&mut self.teachers, t),
                Token::Text(t) => self.subject.push(t),
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Split a cell's text into lesson drafts. Lessons are separated by `;`;
/// within a segment a new line that brings its own subject starts a new
/// lesson, other lines attach to the current one.
fn drafts(text: &str) -> Vec<Draft> {
    let mut drafts = Vec::new();
    for segment in text.split(';') {
        let mut current: Option<Draft> = None;
        for line in segment.lines() {
            let tokens = tokenize(line);
            if tokens.is_empty() {
                continue;
            }
            let has_subject = tokens.iter().any(|t| matches!(t, Token::Text(_)));
            if has_subject && current.as_ref().is_some_and(|d| !d.subject.is_empty()) {
                drafts.extend(current.take());
            }
            current.get_or_insert_with(Draft::default).absorb(tokens);
        }
        drafts.extend(current);
    }
    drafts
}

/// Turn one raw cell into canonical lesson records, one per
/// (lesson, weekday, period).
pub fn normalize_cell(cell: &RawCell) -> Vec<LessonRecord> {
    let mut records = Vec::new();

    for draft in drafts(&cell.text) {
        if draft.subject.is_empty() {
            debug!(
                source = %cell.source,
                row = cell.row,
                column = cell.column,
                text = %cell.text,
                "Lesson text without subject, skipping"
            );
            continue;
        }

        let subject = draft.subject.join(", ");
        let parity = draft.parity.or(cell.parity_hint).unwrap_or(Parity::Both);
        let groups = if draft.groups.is_empty() {
            cell.page_group.iter().cloned().collect()
        } else {
            draft.groups
        };

        for &weekday in cell.weekdays.iter().filter(|day| **day <= 6) {
            for offset in 0..cell.period_span.max(1) {
                let period = cell.period + offset;
                if period == 0 {
                    continue;
                }
                let time = match (offset, &cell.time) {
                    (0, Some(time)) => Some(time.clone()),
                    _ => bell_time(period),
                };

                records.push(LessonRecord {
                    subject: subject.clone(),
                    teachers: draft.teachers.clone(),
                    groups: groups.clone(),
                    places: draft.places.clone(),
                    weekday,
                    period,
                    time,
                    parity,
                });
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeRange;

    fn cell(text: &str, weekdays: Vec<u8>, period: u32) -> RawCell {
        RawCell {
            source: "http://example.com/1/1/1.htm".to_string(),
            row: 1,
            column: 1,
            text: text.to_string(),
            weekdays,
            period,
            period_span: 1,
            time: None,
            parity_hint: None,
            page_group: None,
        }
    }

    #[test]
    fn test_classify_tokens() {
        assert_eq!(classify("нижняя неделя"), Token::Parity(Parity::Odd));
        assert_eq!(classify("Верхняя неделя"), Token::Parity(Parity::Even));
        assert_eq!(classify("нечетная"), Token::Parity(Parity::Odd));
        assert_eq!(classify("чётная"), Token::Parity(Parity::Even));
        assert_eq!(classify("101"), Token::Group("101".to_string()));
        assert_eq!(classify("гр. 102А"), Token::Group("102А".to_string()));
        assert_eq!(classify("ауд.305"), Token::Place("ауд.305".to_string()));
        assert_eq!(classify("5-18"), Token::Place("5-18".to_string()));
        assert_eq!(classify("ЦФА"), Token::Place("ЦФА".to_string()));
        assert_eq!(classify("Иванов И.И."), Token::Teacher("Иванов И.И.".to_string()));
        assert_eq!(classify("И.И. Иванов"), Token::Teacher("И.И. Иванов".to_string()));
        assert_eq!(
            classify("проф. Петров-Водкин П.П."),
            Token::Teacher("Петров-Водкин П.П.".to_string())
        );
        assert_eq!(classify("верх. нед."), Token::Parity(Parity::Even));
        assert_eq!(classify("нечёт."), Token::Parity(Parity::Odd));
        assert_eq!(classify("Иванов И.И"), Token::Teacher("Иванов И.И".to_string()));
        assert_eq!(
            classify("Лабораторный практикум"),
            Token::Text("Лабораторный практикум".to_string())
        );
    }

    #[test]
    fn test_full_cell() {
        let records = normalize_cell(&cell(
            "Матанализ, Иванов И.И., 101, ауд.305, нижняя неделя",
            vec![0],
            1,
        ));

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.subject, "Матанализ");
        assert_eq!(record.teachers, vec!["Иванов И.И."]);
        assert_eq!(record.groups, vec!["101"]);
        assert_eq!(record.places, vec!["ауд.305"]);
        assert_eq!(record.weekday, 0);
        assert_eq!(record.period, 1);
        assert_eq!(record.parity, Parity::Odd);
        assert_eq!(record.time, Some(TimeRange::new("09:00", "10:35")));
    }

    #[test]
    fn test_no_marker_means_both_weeks() {
        let records = normalize_cell(&cell("Физика, 101", vec![1], 2));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parity, Parity::Both);
        assert_eq!(records[0].parity.flags(), (true, true));
    }

    #[test]
    fn test_class_hint_used_without_marker() {
        let mut raw = cell("Физика, 101", vec![1], 2);
        raw.parity_hint = Some(Parity::Even);
        assert_eq!(normalize_cell(&raw)[0].parity, Parity::Even);

        raw.text = "Физика, 101, нижняя неделя".to_string();
        assert_eq!(normalize_cell(&raw)[0].parity, Parity::Odd);
    }

    #[test]
    fn test_group_list_stays_on_one_record() {
        let records = normalize_cell(&cell("Химия, 101, 102А", vec![2], 3));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].groups, vec!["101", "102А"]);
        assert_eq!(records[0].weekday, 2);
        assert_eq!(records[0].period, 3);
    }

    #[test]
    fn test_slash_lists_split() {
        let records = normalize_cell(&cell(
            "Спецкурс, Иванов И.И./Петров П.П., 101/102, ауд.5/ауд.6",
            vec![0],
            1,
        ));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].teachers, vec!["Иванов И.И.", "Петров П.П."]);
        assert_eq!(records[0].groups, vec!["101", "102"]);
        assert_eq!(records[0].places, vec!["ауд.5", "ауд.6"]);
    }

    #[test]
    fn test_slash_inside_subject_kept() {
        let records = normalize_cell(&cell("Физика/практикум, 101", vec![0], 1));
        assert_eq!(records[0].subject, "Физика/практикум");
    }

    #[test]
    fn test_several_lessons_in_one_cell() {
        let records = normalize_cell(&cell(
            "Физика, Иванов И.И., 101; Химия, Петров П.П., 102",
            vec![0],
            1,
        ));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subject, "Физика");
        assert_eq!(records[0].groups, vec!["101"]);
        assert_eq!(records[1].subject, "Химия");
        assert_eq!(records[1].teachers, vec!["Петров П.П."]);
    }

    #[test]
    fn test_lines_attach_to_previous_subject() {
        let records = normalize_cell(&cell(
            "Матанализ\nИванов И.И., ауд.305\nОптика\nПетров П.П.",
            vec![0],
            1,
        ));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].subject, "Матанализ");
        assert_eq!(records[0].teachers, vec!["Иванов И.И."]);
        assert_eq!(records[0].places, vec!["ауд.305"]);
        assert_eq!(records[1].subject, "Оптика");
        assert_eq!(records[1].teachers, vec!["Петров П.П."]);
    }

    #[test]
    fn test_multi_slot_cells_expand() {
        let mut raw = cell("Практикум, 101", vec![0, 2], 3);
        raw.period_span = 2;
        raw.time = Some(TimeRange::new("13:30", "15:00"));

        let records = normalize_cell(&raw);
        let slots: Vec<(u8, u32)> = records.iter().map(|r| (r.weekday, r.period)).collect();
        assert_eq!(slots, vec![(0, 3), (0, 4), (2, 3), (2, 4)]);
        assert!(records.iter().all(|r| r.subject == "Практикум"));
        assert_eq!(records[0].time, Some(TimeRange::new("13:30", "15:00")));
        assert_eq!(records[1].time, Some(TimeRange::new("15:20", "16:55")));
    }

    #[test]
    fn test_page_group_fills_missing_groups() {
        let mut raw = cell("Матанализ, Иванов И.И.", vec![0], 1);
        raw.page_group = Some("141М".to_string());
        assert_eq!(normalize_cell(&raw)[0].groups, vec!["141М"]);

        raw.text = "Матанализ, 101".to_string();
        assert_eq!(normalize_cell(&raw)[0].groups, vec!["101"]);
    }

    #[test]
    fn test_parity_prefixed_subjects_stay_subjects() {
        assert_eq!(classify("Четность"), Token::Text("Четность".to_string()));
        assert_eq!(classify("Верховой"), Token::Text("Верховой".to_string()));
        assert_eq!(classify("Нижний"), Token::Text("Нижний".to_string()));

        let records = normalize_cell(&cell("Четность, 101", vec![0], 1));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject, "Четность");
        assert_eq!(records[0].parity, Parity::Both);
    }

    #[test]
    fn test_teacher_without_final_dot_leaves_subject_clean() {
        let records = normalize_cell(&cell("Оптика, Иванов И.И, 101", vec![0], 1));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject, "Оптика");
        assert_eq!(records[0].teachers, vec!["Иванов И.И"]);
    }

    #[test]
    fn test_cells_without_subject_produce_nothing() {
        assert!(normalize_cell(&cell("Иванов И.И., 101", vec![0], 1)).is_empty());
        assert!(normalize_cell(&cell(" ; ", vec![0], 1)).is_empty());
    }
}
