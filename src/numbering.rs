//! Title numbering: arabic dotted (`1.2.3`), CJK main ordinals (`三、`) and
//! parenthesized CJK ordinals (`（二）`).

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumberingPrefix {
    Arabic(Vec<u32>),
    CjkMain(u32),
    CjkParen(u32),
}

const CJK_MAIN_SEPARATORS: [char; 6] = ['、', '．', '.', '，', ',', '：'];

/// Splits a numbering prefix off a title. Leading markdown markup is skipped first.
pub fn split_prefix(title: &str) -> (Option<NumberingPrefix>, &str) {
    let text = strip_leading_markup(title);
    if let Some((prefix, rest)) = arabic_prefix(text)
        .or_else(|| cjk_paren_prefix(text))
        .or_else(|| cjk_main_prefix(text))
    {
        return (Some(prefix), rest.trim_start());
    }
    (None, text)
}

pub fn prefix_of(title: &str) -> Option<NumberingPrefix> {
    split_prefix(title).0
}

/// Title without its numbering prefix, markup and surrounding whitespace.
pub fn bare_title(title: &str) -> &str {
    split_prefix(title).1.trim().trim_end_matches(['*', '_', '`']).trim()
}

fn strip_leading_markup(title: &str) -> &str {
    title
        .trim_start()
        .trim_start_matches('#')
        .trim_start()
        .trim_start_matches(['*', '_', '`'])
        .trim_start()
}

fn arabic_prefix(text: &str) -> Option<(NumberingPrefix, &str)> {
    let mut parts = Vec::new();
    let mut idx = 0usize;
    let bytes = text.as_bytes();
    let mut trailing_dot = false;
    loop {
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx == start {
            if parts.is_empty() {
                return None;
            }
            break;
        }
        parts.push(text[start..idx].parse::<u32>().ok()?);
        trailing_dot = false;
        if idx < bytes.len() && bytes[idx] == b'.' {
            idx += 1;
            trailing_dot = true;
            continue;
        }
        break;
    }

    let rest = &text[idx..];
    let dotted = parts.len() > 1 || trailing_dot;
    if !dotted {
        // A bare number needs a separator, so "2024年" stays a title.
        let next = rest.chars().next();
        match next {
            Some(c) if c.is_whitespace() => {}
            Some('、') => return Some((NumberingPrefix::Arabic(parts), &rest['、'.len_utf8()..])),
            _ => return None,
        }
    } else if rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let rest = rest.strip_prefix('、').unwrap_or(rest);
    Some((NumberingPrefix::Arabic(parts), rest))
}

fn cjk_paren_prefix(text: &str) -> Option<(NumberingPrefix, &str)> {
    let inner = text
        .strip_prefix('（')
        .or_else(|| text.strip_prefix('('))?;
    let close = inner.find(['）', ')'])?;
    let n = cjk_to_number(&inner[..close])?;
    let close_len = inner[close..].chars().next()?.len_utf8();
    Some((NumberingPrefix::CjkParen(n), &inner[close + close_len..]))
}

fn cjk_main_prefix(text: &str) -> Option<(NumberingPrefix, &str)> {
    let end = text.find(|c: char| !is_cjk_digit(c))?;
    if end == 0 {
        return None;
    }
    let n = cjk_to_number(&text[..end])?;
    let rest = &text[end..];
    let sep = rest.chars().next()?;
    if !CJK_MAIN_SEPARATORS.contains(&sep) {
        return None;
    }
    Some((NumberingPrefix::CjkMain(n), &rest[sep.len_utf8()..]))
}

fn is_cjk_digit(c: char) -> bool {
    cjk_digit(c).is_some() || c == '十'
}

fn cjk_digit(c: char) -> Option<u32> {
    Some(match c {
        '一' => 1,
        '二' => 2,
        '三' => 3,
        '四' => 4,
        '五' => 5,
        '六' => 6,
        '七' => 7,
        '八' => 8,
        '九' => 9,
        _ => return None,
    })
}

/// Parses 一 … 九十九.
pub fn cjk_to_number(text: &str) -> Option<u32> {
    let chars: Vec<char> = text.trim().chars().collect();
    match chars.as_slice() {
        ['十'] => Some(10),
        [d] => cjk_digit(*d),
        ['十', d] => Some(10 + cjk_digit(*d)?),
        [t, '十'] => Some(cjk_digit(*t)? * 10),
        [t, '十', d] => Some(cjk_digit(*t)? * 10 + cjk_digit(*d)?),
        _ => None,
    }
}

pub fn to_cjk(n: u32) -> String {
    const DIGITS: [&str; 10] = ["", "一", "二", "三", "四", "五", "六", "七", "八", "九"];
    match n {
        0 => "零".to_owned(),
        1..=9 => DIGITS[n as usize].to_owned(),
        10..=19 => format!("十{}", DIGITS[(n % 10) as usize]),
        20..=99 => format!("{}十{}", DIGITS[(n / 10) as usize], DIGITS[(n % 10) as usize]),
        _ => n.to_string(),
    }
}

/// Case-folded, prefix- and markup-free, whitespace-collapsed title used for
/// uniqueness checks.
pub fn normalize_title(title: &str) -> String {
    let bare = split_prefix(title).1;
    let cleaned: String = bare
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '#'))
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches([':', '：'])
        .trim()
        .to_lowercase()
}

/// Numbering path of a prefix. Parenthesized CJK ordinals hang under the most
/// recent main ordinal.
pub fn numbering_key(prefix: &NumberingPrefix, current_main: Option<u32>) -> Vec<u32> {
    match prefix {
        NumberingPrefix::Arabic(parts) => parts.clone(),
        NumberingPrefix::CjkMain(n) => vec![*n],
        NumberingPrefix::CjkParen(n) => match current_main {
            Some(main) => vec![main, *n],
            None => vec![*n],
        },
    }
}

/// Component-wise order; a missing component sorts as -1.
pub fn compare_keys(a: &[u32], b: &[u32]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).map_or(-1, |v| i64::from(*v));
        let right = b.get(i).map_or(-1, |v| i64::from(*v));
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Label for the `k`-th child of a parent carrying `parent_prefix`.
pub fn child_label(
    parent_prefix: Option<&NumberingPrefix>,
    parent_key: &[u32],
    k: u32,
) -> Option<String> {
    match parent_prefix? {
        NumberingPrefix::Arabic(_) | NumberingPrefix::CjkParen(_) => {
            let mut path: Vec<String> = parent_key.iter().map(u32::to_string).collect();
            path.push(k.to_string());
            Some(path.join("."))
        }
        NumberingPrefix::CjkMain(_) => Some(format!("（{}）", to_cjk(k))),
    }
}

pub fn labeled_title(label: Option<&str>, bare: &str) -> String {
    match label {
        Some(label) if label.starts_with('（') => format!("{label}{bare}"),
        Some(label) => format!("{label} {bare}"),
        None => bare.to_owned(),
    }
}

/// Markdown ATX heading: `(level, text)`.
pub fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    if text.is_empty() {
        return None;
    }
    Some((level, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arabic_prefixes() {
        assert_eq!(
            split_prefix("1.1.1 市场规模"),
            (Some(NumberingPrefix::Arabic(vec![1, 1, 1])), "市场规模")
        );
        assert_eq!(
            split_prefix("## 2. 目标"),
            (Some(NumberingPrefix::Arabic(vec![2])), "目标")
        );
        assert_eq!(
            split_prefix("3 Scope"),
            (Some(NumberingPrefix::Arabic(vec![3])), "Scope")
        );
        assert_eq!(split_prefix("2024年工作总结").0, None);
        assert_eq!(
            split_prefix("1.2背景"),
            (Some(NumberingPrefix::Arabic(vec![1, 2])), "背景")
        );
    }

    #[test]
    fn cjk_prefixes() {
        assert_eq!(
            split_prefix("三、市场分析"),
            (Some(NumberingPrefix::CjkMain(3)), "市场分析")
        );
        assert_eq!(
            split_prefix("（十二）风险"),
            (Some(NumberingPrefix::CjkParen(12)), "风险")
        );
        assert_eq!(
            split_prefix("(二) 预算"),
            (Some(NumberingPrefix::CjkParen(2)), "预算")
        );
        assert_eq!(split_prefix("一般规定").0, None);
    }

    #[test]
    fn tenth_ordinal_is_recognized() {
        assert_eq!(cjk_to_number("十"), Some(10));
        assert_eq!(
            split_prefix("十、附录"),
            (Some(NumberingPrefix::CjkMain(10)), "附录")
        );
        assert_eq!(
            split_prefix("（十）其他"),
            (Some(NumberingPrefix::CjkParen(10)), "其他")
        );
    }

    #[test]
    fn cjk_numbers_round_trip_through_labels() {
        for n in [1, 9, 10, 11, 20, 35, 99] {
            assert_eq!(cjk_to_number(&to_cjk(n)), Some(n));
        }
    }

    #[test]
    fn normalized_titles_ignore_numbering_and_markup() {
        assert_eq!(normalize_title("1.1 **Background**"), "background");
        assert_eq!(normalize_title("## 一、 背景："), "背景");
        assert_eq!(normalize_title("背景"), normalize_title("（三）背景"));
    }

    #[test]
    fn keys_compare_with_missing_components_first() {
        assert_eq!(compare_keys(&[1], &[1, 1]), Ordering::Less);
        assert_eq!(compare_keys(&[2], &[1, 9]), Ordering::Greater);
        assert_eq!(compare_keys(&[1, 2], &[1, 10]), Ordering::Less);
    }

    #[test]
    fn child_labels_follow_parent_scheme() {
        let arabic = NumberingPrefix::Arabic(vec![1]);
        assert_eq!(child_label(Some(&arabic), &[1], 2).as_deref(), Some("1.2"));
        let main = NumberingPrefix::CjkMain(2);
        assert_eq!(child_label(Some(&main), &[2], 1).as_deref(), Some("（一）"));
        let paren = NumberingPrefix::CjkParen(1);
        assert_eq!(child_label(Some(&paren), &[2, 1], 3).as_deref(), Some("2.1.3"));
        assert_eq!(child_label(None, &[], 1), None);
        assert_eq!(labeled_title(Some("1.1"), "背景"), "1.1 背景");
        assert_eq!(labeled_title(Some("（一）"), "背景"), "（一）背景");
    }

    #[test]
    fn headings_need_a_space_after_hashes() {
        assert_eq!(parse_heading("## 背景"), Some((2, "背景")));
        assert_eq!(parse_heading("  ### 1.2 目标 ##"), Some((3, "1.2 目标")));
        assert_eq!(parse_heading("#hashtag"), None);
        assert_eq!(parse_heading("####### deep"), None);
    }
}
