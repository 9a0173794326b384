//! Title/year match scoring shared by the providers.

/// Confidence that `result_title` is what the user searched for.
///
/// Title similarity contributes up to 0.5, year proximity up to 0.3.
pub fn confidence(
    query_title: &str,
    result_title: &str,
    query_year: Option<u16>,
    result_year: Option<u16>,
) -> f64 {
    let query_title = query_title.trim();
    let result_title = result_title.trim();

    let base = if query_title.is_empty() || result_title.is_empty() {
        0.0
    } else if query_title == result_title {
        0.5
    } else if query_title.to_lowercase() == result_title.to_lowercase() {
        0.4
    } else if result_title
        .to_lowercase()
        .contains(&query_title.to_lowercase())
    {
        0.2
    } else {
        0.1
    };

    let year_bonus = match (query_year, result_year) {
        (Some(q), Some(r)) if q == r => 0.3,
        (Some(q), Some(r)) if q.abs_diff(r) <= 1 => 0.15,
        _ => 0.0,
    };

    base + year_bonus
}

/// Best score over every name a result is known by.
pub fn best_confidence<'a>(
    query_title: &str,
    names: impl IntoIterator<Item = &'a str>,
    query_year: Option<u16>,
    result_year: Option<u16>,
) -> f64 {
    names
        .into_iter()
        .map(|name| confidence(query_title, name, query_year, result_year))
        .fold(0.0, f64::max)
}

/// Four-digit year at the start of a date like `"2023-04-15"`.
pub fn parse_year(date: Option<&str>) -> Option<u16> {
    date.and_then(|d| d.get(..4))
        .and_then(|y| y.parse::<u16>().ok())
        .filter(|y| *y > 1800)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_title_and_year() {
        let score = confidence("Inception", "Inception", Some(2010), Some(2010));
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_case_insensitive_unicode() {
        let score = confidence("amélie", "Amélie", None, None);
        assert!((score - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_contains_and_close_year() {
        let score = confidence("Alien", "Aliens", Some(1986), Some(1987));
        assert!((score - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_no_match() {
        let score = confidence("Heat", "Titanic", Some(1995), Some(1997));
        assert!((score - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_best_over_names() {
        let names = ["霸王别姬", "Farewell My Concubine"];
        let score = best_confidence("Farewell My Concubine", names, None, None);
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_year() {
        assert_eq!(parse_year(Some("1995-12-15")), Some(1995));
        assert_eq!(parse_year(Some("")), None);
        assert_eq!(parse_year(Some("n/a")), None);
        assert_eq!(parse_year(None), None);
    }
}
