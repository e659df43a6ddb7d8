use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, convert::TryFrom, fmt};

/// Grouped WMO weather condition used as the classifier target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherCategory {
    Clear,
    Fog,
    Drizzle,
    Rain,
    Snow,
    Other,
}

/// Number of categories the classifier predicts.
pub const NUM_CLASSES: usize = 6;

impl WeatherCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeatherCategory::Clear => "clear",
            WeatherCategory::Fog => "fog",
            WeatherCategory::Drizzle => "drizzle",
            WeatherCategory::Rain => "rain",
            WeatherCategory::Snow => "snow",
            WeatherCategory::Other => "other",
        }
    }

    pub const fn all() -> &'static [WeatherCategory] {
        &[
            WeatherCategory::Clear,
            WeatherCategory::Fog,
            WeatherCategory::Drizzle,
            WeatherCategory::Rain,
            WeatherCategory::Snow,
            WeatherCategory::Other,
        ]
    }

    /// Class index fed to the model.
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    /// WMO codes explicitly listed for this group. `Other` lists none and
    /// doubles as the fallback for unknown codes.
    pub fn listed_codes(&self) -> &'static [i64] {
        match self {
            WeatherCategory::Clear => &[0, 1, 2, 3],
            WeatherCategory::Fog => &[45, 48],
            WeatherCategory::Drizzle => &[51, 53, 55, 56, 57],
            WeatherCategory::Rain => &[61, 63, 65, 80, 81, 82],
            WeatherCategory::Snow => &[66, 67, 71, 73, 75, 77, 85, 86],
            WeatherCategory::Other => &[],
        }
    }

    /// Map a raw WMO code to its group; unknown codes land in `Other`.
    pub fn from_wmo_code(code: i64) -> Self {
        Self::all()
            .iter()
            .copied()
            .find(|group| group.listed_codes().contains(&code))
            .unwrap_or(WeatherCategory::Other)
    }
}

impl fmt::Display for WeatherCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for WeatherCategory {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        WeatherCategory::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown weather category '{value}'. Supported: clear, fog, drizzle, rain, snow, other."
                )
            })
    }
}

/// Code to category table for the codes observed in one dataset.
///
/// Built once per load and never persisted with the data, so the `other`
/// bucket of two runs may cover different raw codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMapping {
    codes: BTreeMap<i64, WeatherCategory>,
}

impl CodeMapping {
    /// Start from every listed code, then add each observed code.
    pub fn from_observed<I: IntoIterator<Item = i64>>(observed: I) -> Self {
        let mut codes = BTreeMap::new();
        for group in WeatherCategory::all() {
            for &code in group.listed_codes() {
                codes.insert(code, *group);
            }
        }
        for code in observed {
            codes
                .entry(code)
                .or_insert_with(|| WeatherCategory::from_wmo_code(code));
        }
        Self { codes }
    }

    pub fn category(&self, code: i64) -> WeatherCategory {
        self.codes
            .get(&code)
            .copied()
            .unwrap_or_else(|| WeatherCategory::from_wmo_code(code))
    }

    /// Observed codes that matched no listed group.
    pub fn unlisted_codes(&self) -> Vec<i64> {
        self.codes
            .iter()
            .filter(|(code, cat)| {
                **cat == WeatherCategory::Other
                    && !WeatherCategory::Other.listed_codes().contains(*code)
            })
            .map(|(code, _)| *code)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, WeatherCategory)> + '_ {
        self.codes.iter().map(|(code, cat)| (*code, *cat))
    }

    /// Human-readable table, one category per line.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        for category in WeatherCategory::all() {
            let codes: Vec<String> = self
                .iter()
                .filter(|(_, c)| c == category)
                .map(|(code, _)| code.to_string())
                .collect();
            out.push_str(&format!(
                "  {:>1} {:<8} <- [{}]\n",
                category.index(),
                category.as_str(),
                codes.join(", ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_codes_map_into_range() {
        for category in WeatherCategory::all() {
            for &code in category.listed_codes() {
                let mapped = WeatherCategory::from_wmo_code(code);
                assert_eq!(mapped, *category);
                assert!(mapped.index() < NUM_CLASSES);
            }
        }
    }

    #[test]
    fn unknown_codes_fall_back_to_other() {
        for code in [4, 44, 62, 95, 96, 99, 999, -1] {
            assert_eq!(WeatherCategory::from_wmo_code(code), WeatherCategory::Other);
            assert_eq!(WeatherCategory::from_wmo_code(code).index(), 5);
        }
    }

    #[test]
    fn category_as_str_roundtrip() {
        for category in WeatherCategory::all() {
            let parsed = WeatherCategory::try_from(category.as_str()).expect("roundtrip");
            assert_eq!(*category, parsed);
            assert_eq!(WeatherCategory::from_index(category.index()), Some(*category));
        }
        assert!(WeatherCategory::from_index(NUM_CLASSES).is_none());
    }

    #[test]
    fn unknown_category_name_errors() {
        let err = WeatherCategory::try_from("hail").unwrap_err();
        assert!(err.to_string().contains("Unknown weather category"));
    }

    #[test]
    fn mapping_covers_observed_codes() {
        let mapping = CodeMapping::from_observed([0, 61, 71, 999]);

        assert_eq!(mapping.category(0), WeatherCategory::Clear);
        assert_eq!(mapping.category(61), WeatherCategory::Rain);
        assert_eq!(mapping.category(71), WeatherCategory::Snow);
        assert_eq!(mapping.category(999), WeatherCategory::Other);
        assert_eq!(mapping.unlisted_codes(), vec![999]);
    }

    #[test]
    fn table_lists_every_category() {
        let table = CodeMapping::from_observed([95]).render_table();
        for category in WeatherCategory::all() {
            assert!(table.contains(category.as_str()));
        }
        assert!(table.contains("95"));
    }

    #[test]
    fn table_rows_follow_category_order() {
        let table = CodeMapping::from_observed([999, 2]).render_table();
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "  0 clear    <- [0, 1, 2, 3]");
        assert_eq!(lines[5], "  5 other    <- [999]");
    }
}
