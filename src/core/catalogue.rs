// src/core/catalogue.rs

//! The static variable catalogue: keyword -> network mode, loaded once at
//! startup from the PSX `Variables.txt` definition format.
//!
//! The file's declared order is retained; it defines the order of the
//! synthesised welcome replay, because some clients are order-sensitive.

use crate::core::RouterError;
use indexmap::IndexMap;
use std::path::Path;

/// The network mode vocabulary of the catalogue file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkMode {
    Econ,
    Delta,
    Start,
    Xecon,
    Xdelta,
    Demand,
    Mcpmom,
    Bigmom,
    Guamom4,
    Guamom2,
    Cdukeyb,
    Rcp,
    Acp,
    Mixed,
}

impl NetworkMode {
    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ECON" => Self::Econ,
            "DELTA" => Self::Delta,
            "START" => Self::Start,
            "XECON" => Self::Xecon,
            "XDELTA" => Self::Xdelta,
            "DEMAND" => Self::Demand,
            "MCPMOM" => Self::Mcpmom,
            "BIGMOM" => Self::Bigmom,
            "GUAMOM4" => Self::Guamom4,
            "GUAMOM2" => Self::Guamom2,
            "CDUKEYB" => Self::Cdukeyb,
            "RCP" => Self::Rcp,
            "ACP" => Self::Acp,
            "MIXED" => Self::Mixed,
            _ => return None,
        })
    }

    /// DELTA-family values are pulses; they must never enter the cache.
    pub fn is_delta_family(self) -> bool {
        matches!(self, Self::Delta | Self::Xdelta)
    }
}

/// One catalogue entry.
#[derive(Debug, Clone)]
pub struct VariableDef {
    pub name: String,
    pub mode: NetworkMode,
    pub min: i64,
    pub max: i64,
    /// Extra behaviors on top of the declared mode (the Qs493/Qi208
    /// also-ECON cases).
    pub also_econ: bool,
    /// Member of the fixed set only sent to clients without `nolong`.
    pub nolong: bool,
}

/// Keywords that behave as ECON in addition to their declared mode, and
/// the fixed NOLONG keyword set. See the Aerowinx networkers notes.
const ALSO_ECON: &[&str] = &["Qs493", "Qi208"];
const NOLONG_KEYWORDS: &[&str] = &[
    "Qs375", "Qs376", "Qs377", "Qs407", "Qs408", "Qs409", "Qs410", "Qs411", "Qs412",
];

/// The parsed catalogue. Entry order matches the file's declared order.
#[derive(Debug, Default)]
pub struct VariableCatalogue {
    variables: IndexMap<String, VariableDef>,
}

impl VariableCatalogue {
    /// Loads the catalogue from a `Variables.txt` file.
    pub fn from_file(path: &Path) -> Result<Self, RouterError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RouterError::Catalogue(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_data(&data)
    }

    /// Parses catalogue data in the `Variables.txt` format:
    /// `Qs0="CfgRego"; Mode=ECON; Min=0; Max=8;` with `[...]` section
    /// headers. Missing fields and duplicate keywords are startup errors.
    pub fn from_data(data: &str) -> Result<Self, RouterError> {
        let mut variables: IndexMap<String, VariableDef> = IndexMap::new();
        let mut partial: IndexMap<String, (Option<NetworkMode>, Option<i64>, Option<i64>, String)> =
            IndexMap::new();

        let mut current_key: Option<String> = None;
        for raw_line in data.lines() {
            let line = raw_line.trim_end();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }
            for elem in line.split(';') {
                let elem = elem.trim();
                if elem.is_empty() {
                    continue;
                }
                let (key, value) = elem.split_once('=').ok_or_else(|| {
                    RouterError::Catalogue(format!("invalid line: {line}"))
                })?;
                if key.starts_with('Q') || key.starts_with('L') {
                    let name = value.replace('"', "");
                    if partial.contains_key(key) {
                        return Err(RouterError::Catalogue(format!(
                            "duplicate keyword {key}"
                        )));
                    }
                    partial.insert(key.to_string(), (None, None, None, name));
                    current_key = Some(key.to_string());
                } else {
                    let Some(this_key) = &current_key else {
                        return Err(RouterError::Catalogue(format!(
                            "attribute before any keyword: {line}"
                        )));
                    };
                    let entry = partial.get_mut(this_key).ok_or_else(|| {
                        RouterError::Catalogue(format!("unknown keyword {this_key}"))
                    })?;
                    match key {
                        "Mode" => {
                            entry.0 = Some(NetworkMode::from_str(value).ok_or_else(|| {
                                RouterError::Catalogue(format!(
                                    "unknown network mode {value} for {this_key}"
                                ))
                            })?);
                        }
                        "Min" => {
                            entry.1 = Some(value.parse().map_err(|_| {
                                RouterError::Catalogue(format!("invalid Min in line: {line}"))
                            })?);
                        }
                        "Max" => {
                            entry.2 = Some(value.parse().map_err(|_| {
                                RouterError::Catalogue(format!("invalid Max in line: {line}"))
                            })?);
                        }
                        // Other attributes exist in the file format but are
                        // irrelevant to routing.
                        _ => {}
                    }
                }
            }
        }

        for (keyword, (mode, min, max, name)) in partial {
            let mode = mode.ok_or_else(|| {
                RouterError::Catalogue(format!("Mode missing for {keyword}"))
            })?;
            let min = min.ok_or_else(|| {
                RouterError::Catalogue(format!("Min missing for {keyword}"))
            })?;
            let max = max.ok_or_else(|| {
                RouterError::Catalogue(format!("Max missing for {keyword}"))
            })?;
            let also_econ = ALSO_ECON.contains(&keyword.as_str());
            let nolong = NOLONG_KEYWORDS.contains(&keyword.as_str());
            variables.insert(
                keyword,
                VariableDef {
                    name,
                    mode,
                    min,
                    max,
                    also_econ,
                    nolong,
                },
            );
        }

        Ok(Self { variables })
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Looks up a keyword's definition.
    pub fn get(&self, keyword: &str) -> Option<&VariableDef> {
        self.variables.get(keyword)
    }

    pub fn mode_of(&self, keyword: &str) -> Option<NetworkMode> {
        self.variables.get(keyword).map(|v| v.mode)
    }

    /// Position in the file's declared order, used for welcome replay.
    pub fn declared_index(&self, keyword: &str) -> Option<usize> {
        self.variables.get_index_of(keyword)
    }

    /// True if the keyword's mode is DELTA with no cacheable secondary
    /// behavior. Such keywords never enter the cache.
    pub fn is_pure_delta(&self, keyword: &str) -> bool {
        self.variables
            .get(keyword)
            .is_some_and(|v| v.mode.is_delta_family() && !v.also_econ)
    }

    /// True if the keyword's mode is START without also behaving as ECON.
    /// Such keywords are only forwarded to peer routers and to clients in
    /// their welcome window.
    pub fn is_pure_start(&self, keyword: &str) -> bool {
        self.variables
            .get(keyword)
            .is_some_and(|v| v.mode == NetworkMode::Start && !v.also_econ)
    }

    /// The pure-START keyword set, used to decide when a welcome's start
    /// window is complete.
    pub fn pure_start_keywords(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|(k, _)| self.is_pure_start(k))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// The built-in NOLONG keyword set (before any config override).
    pub fn nolong_keywords(&self) -> Vec<String> {
        NOLONG_KEYWORDS.iter().map(|s| s.to_string()).collect()
    }

    /// True for keywords the PSX protocol itself defines, including the
    /// non-variable signals. Called for every received message, so no
    /// regexes here.
    pub fn is_psx_keyword(&self, keyword: &str) -> bool {
        let mut chars = keyword.chars();
        match (chars.next(), chars.next()) {
            (Some('Q'), Some('h' | 's' | 'd' | 'i')) => true,
            (Some('L'), Some('s' | 'i' | 'h')) => true,
            _ => matches!(
                keyword,
                "exit"
                    | "cduC"
                    | "cduL"
                    | "cduR"
                    | "bang"
                    | "name"
                    | "id"
                    | "start"
                    | "lexicon"
                    | "again"
                    | "gid"
                    | "version"
                    | "layout"
                    | "metar"
                    | "demand"
                    | "load1"
                    | "load2"
                    | "load3"
                    | "nolong"
                    | "pleaseBeSoKindAndQuit"
                    | "keepalive"
            ),
        }
    }

    /// Sorts keywords the way PSX emits them: alphabetically with embedded
    /// numbers compared numerically (`Qs1 < Qs42 < Qs100`).
    pub fn sort_psx_keywords(&self, keywords: &mut [String]) {
        keywords.sort_by(|a, b| psx_sort_key(a).cmp(&psx_sort_key(b)));
    }
}

/// Splits a keyword into alternating text/number segments for the PSX
/// numeric sort.
fn psx_sort_key(keyword: &str) -> Vec<(String, u64)> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut number = String::new();
    for ch in keyword.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
        } else {
            if !number.is_empty() {
                segments.push((text.to_lowercase(), number.parse().unwrap_or(u64::MAX)));
                text = String::new();
                number.clear();
            }
            text.push(ch);
        }
    }
    segments.push((
        text.to_lowercase(),
        if number.is_empty() {
            0
        } else {
            number.parse().unwrap_or(u64::MAX)
        },
    ));
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psx_numeric_sort() {
        let cat = VariableCatalogue::default();
        let mut keys = vec![
            "Qs1".to_string(),
            "Qs100".to_string(),
            "Qs999".to_string(),
            "Qs42".to_string(),
        ];
        cat.sort_psx_keywords(&mut keys);
        assert_eq!(keys, vec!["Qs1", "Qs42", "Qs100", "Qs999"]);
    }
}
