//! Viseme mapping for lip-sync animation.
//!
//! A viseme is a visual mouth shape that corresponds to a phoneme (sound).
//! The synthesis service reports phoneme tokens per utterance; this module
//! maps them onto the closed [`Viseme`] set the avatar assets are drawn for,
//! and builds the per-utterance [`SpeechTimingTrack`].

mod track;

pub use track::{PhonemeTiming, SpeechTimingTrack, TimingEntry};

use std::collections::{BTreeMap, HashMap};

use avatar_cdn::Viseme;

/// Language used when none is given or the requested one has no table.
pub const DEFAULT_LANGUAGE: &str = "en";

type Row = (Viseme, &'static [&'static str]);

// Rows are applied in order and the first row to claim a token keeps it, so
// a token listed under two sounds maps to the earlier one.
const EN: &[Row] = &[
    (Viseme::A, &["ah", "aa", "aw"]),
    (Viseme::E, &["eh", "ey", "ay"]),
    (Viseme::I, &["ih", "iy", "ee"]),
    (Viseme::O, &["oh", "ow", "ao"]),
    (Viseme::U, &["uh", "uw", "oo"]),
    (Viseme::Mbp, &["m", "mm"]),
    (Viseme::Mbp, &["p", "pp"]),
    (Viseme::Mbp, &["b", "bb"]),
    (Viseme::Fv, &["f", "ff"]),
    (Viseme::Fv, &["v", "vv"]),
    (Viseme::Dntl, &["l", "ll"]),
    (Viseme::S, &["s", "ss"]),
    (Viseme::Dntl, &["t", "tt"]),
    (Viseme::Dntl, &["d", "dd"]),
    (Viseme::Dntl, &["n", "nn"]),
    (Viseme::Kg, &["k", "kk"]),
    (Viseme::Kg, &["g", "gg"]),
    (Viseme::Kg, &["h", "hh"]),
    (Viseme::R, &["r", "rr"]),
    (Viseme::Wq, &["w", "ww"]),
    (Viseme::I, &["y", "yy"]),
    (Viseme::Th, &["th"]),
    (Viseme::S, &["sh"]),
    (Viseme::S, &["ch"]),
    (Viseme::S, &["j", "jj"]),
    (Viseme::Kg, &["ng"]),
    (Viseme::S, &["zh"]),
    // ARPABET symbols not covered above (stress digits are stripped first).
    (Viseme::A, &["ae"]),
    (Viseme::R, &["er"]),
    (Viseme::O, &["oy"]),
    (Viseme::S, &["jh", "z"]),
    (Viseme::Th, &["dh"]),
    (Viseme::Mbp, &["em"]),
    (Viseme::Dntl, &["dx", "nx", "el", "en"]),
];

const ES: &[Row] = &[
    (Viseme::A, &["a", "á"]),
    (Viseme::E, &["e", "é"]),
    (Viseme::I, &["i", "í"]),
    (Viseme::O, &["o", "ó"]),
    (Viseme::U, &["u", "ú"]),
    (Viseme::Mbp, &["m"]),
    (Viseme::Mbp, &["p"]),
    (Viseme::Mbp, &["b", "v"]),
    (Viseme::Fv, &["f"]),
    (Viseme::Fv, &["v", "b"]),
    (Viseme::Dntl, &["l"]),
    (Viseme::S, &["s"]),
    (Viseme::Dntl, &["t"]),
    (Viseme::Dntl, &["d"]),
    (Viseme::Dntl, &["n", "ñ"]),
    (Viseme::Kg, &["k", "c", "qu"]),
    (Viseme::Kg, &["g"]),
    (Viseme::Kg, &["h"]),
    (Viseme::R, &["r", "rr"]),
    (Viseme::Wq, &["w"]),
    (Viseme::I, &["y", "ll"]),
    (Viseme::Th, &["z"]),
    (Viseme::S, &["ch"]),
    (Viseme::S, &["j", "g"]),
    (Viseme::Kg, &["ng"]),
];

const FR: &[Row] = &[
    (Viseme::A, &["a", "â"]),
    (Viseme::E, &["e", "é", "è", "ê"]),
    (Viseme::I, &["i", "î"]),
    (Viseme::O, &["o", "ô"]),
    (Viseme::U, &["u", "û"]),
    (Viseme::Mbp, &["m"]),
    (Viseme::Mbp, &["p"]),
    (Viseme::Mbp, &["b"]),
    (Viseme::Fv, &["f"]),
    (Viseme::Fv, &["v"]),
    (Viseme::Dntl, &["l"]),
    (Viseme::S, &["s"]),
    (Viseme::Dntl, &["t"]),
    (Viseme::Dntl, &["d"]),
    (Viseme::Dntl, &["n"]),
    (Viseme::Kg, &["k", "c", "qu"]),
    (Viseme::Kg, &["g"]),
    (Viseme::Kg, &["h"]),
    (Viseme::R, &["r"]),
    (Viseme::Wq, &["w"]),
    (Viseme::I, &["y"]),
    (Viseme::Th, &["th"]),
    (Viseme::S, &["ch"]),
    (Viseme::S, &["j"]),
    (Viseme::Kg, &["gn"]),
    (Viseme::S, &["ge"]),
];

const SILENCE: &[&str] = &["", "sil", "sp", "pau", "spn"];

type Table = HashMap<String, Viseme>;

fn build_table(rows: &[Row]) -> Table {
    let mut table = Table::new();
    for (viseme, tokens) in rows {
        for token in *tokens {
            table.entry((*token).to_owned()).or_insert(*viseme);
        }
    }
    table
}

/// Maps phoneme tokens to visemes, per language.
///
/// Built once at start-up and shared immutably. Lookup is total: silence
/// and unknown tokens map to [`Viseme::Rest`].
#[derive(Debug, Clone)]
pub struct VisemeMapper {
    tables: HashMap<String, Table>,
    default_language: String,
}

impl Default for VisemeMapper {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGE)
    }
}

impl VisemeMapper {
    /// Mapper with the built-in `en`, `es` and `fr` tables.
    pub fn new(default_language: &str) -> Self {
        let mut tables = HashMap::new();
        tables.insert("en".to_owned(), build_table(EN));
        tables.insert("es".to_owned(), build_table(ES));
        tables.insert("fr".to_owned(), build_table(FR));
        let default_language = default_language.trim().to_lowercase();
        Self {
            tables,
            default_language,
        }
    }

    /// Built-in tables plus configured ones.
    ///
    /// A configured table for an existing language overrides individual
    /// tokens; a new language gets a table of its own.
    pub fn with_tables(
        default_language: &str,
        extra: &BTreeMap<String, BTreeMap<String, Viseme>>,
    ) -> Self {
        let mut mapper = Self::new(default_language);
        for (language, entries) in extra {
            let table = mapper.tables.entry(language.to_lowercase()).or_default();
            for (token, viseme) in entries {
                table.insert(token.trim().to_lowercase(), *viseme);
            }
        }
        mapper
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Whether a table exists for `language`.
    pub fn supports(&self, language: &str) -> bool {
        self.tables.contains_key(&language.to_lowercase())
    }

    fn table_for(&self, language: &str) -> Option<&Table> {
        self.tables
            .get(&language.to_lowercase())
            .or_else(|| self.tables.get(&self.default_language))
            .or_else(|| self.tables.get(DEFAULT_LANGUAGE))
    }

    /// Map one phoneme token to a viseme.
    ///
    /// Matching is exact and case-insensitive. Tokens that already name a
    /// viseme (`A`, `MBP`, `REST`, ...) map to themselves; ARPABET stress
    /// digits are ignored.
    pub fn map_to_viseme(&self, token: &str, language: &str) -> Viseme {
        let token = token.trim();
        let lower = token.to_lowercase();
        if SILENCE.contains(&lower.as_str()) {
            return Viseme::Rest;
        }
        let Some(table) = self.table_for(language) else {
            return Viseme::Rest;
        };
        if let Some(viseme) = table.get(&lower) {
            return *viseme;
        }
        if let Some(viseme) = Viseme::from_name(token) {
            return viseme;
        }
        let unstressed = lower.trim_end_matches(['0', '1', '2']);
        if unstressed != lower
            && let Some(viseme) = table.get(unstressed)
        {
            return *viseme;
        }
        Viseme::Rest
    }

    /// Map a whitespace-separated phoneme string.
    pub fn map_sequence(&self, phonemes: &str, language: &str) -> Vec<Viseme> {
        phonemes
            .split_whitespace()
            .map(|p| self.map_to_viseme(p, language))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_and_unknown_are_rest() {
        let mapper = VisemeMapper::default();
        for token in ["", "  ", "sil", "SP", "pau", "xyzzy", "7"] {
            assert_eq!(mapper.map_to_viseme(token, "en"), Viseme::Rest, "{token:?}");
        }
    }

    #[test]
    fn mapping_is_total_over_every_table() {
        let mapper = VisemeMapper::default();
        for language in ["en", "es", "fr", "de", ""] {
            for token in ["a", "qu", "ñ", "zz", "th", "ER1"] {
                let viseme = mapper.map_to_viseme(token, language);
                assert!(Viseme::all().contains(&viseme));
            }
        }
    }

    #[test]
    fn english_consonant_groups() {
        let mapper = VisemeMapper::default();
        for token in ["m", "P", "bb"] {
            assert_eq!(mapper.map_to_viseme(token, "en"), Viseme::Mbp);
        }
        assert_eq!(mapper.map_to_viseme("f", "en"), Viseme::Fv);
        assert_eq!(mapper.map_to_viseme("tt", "en"), Viseme::Dntl);
        assert_eq!(mapper.map_to_viseme("ng", "en"), Viseme::Kg);
        assert_eq!(mapper.map_to_viseme("sh", "en"), Viseme::S);
        assert_eq!(mapper.map_to_viseme("th", "en"), Viseme::Th);
        assert_eq!(mapper.map_to_viseme("w", "en"), Viseme::Wq);
        assert_eq!(mapper.map_to_viseme("y", "en"), Viseme::I);
    }

    #[test]
    fn arpabet_with_stress_digits() {
        let mapper = VisemeMapper::default();
        assert_eq!(mapper.map_to_viseme("AA1", "en"), Viseme::A);
        assert_eq!(mapper.map_to_viseme("IY0", "en"), Viseme::I);
        assert_eq!(mapper.map_to_viseme("DH", "en"), Viseme::Th);
        assert_eq!(mapper.map_to_viseme("JH", "en"), Viseme::S);
    }

    #[test]
    fn viseme_names_map_to_themselves() {
        let mapper = VisemeMapper::default();
        for viseme in Viseme::all() {
            assert_eq!(mapper.map_to_viseme(viseme.as_str(), "es"), *viseme);
        }
    }

    #[test]
    fn spanish_first_match_wins() {
        let mapper = VisemeMapper::default();
        assert_eq!(mapper.map_to_viseme("v", "es"), Viseme::Mbp);
        assert_eq!(mapper.map_to_viseme("g", "es"), Viseme::Kg);
        assert_eq!(mapper.map_to_viseme("ll", "es"), Viseme::I);
        assert_eq!(mapper.map_to_viseme("z", "es"), Viseme::Th);
        assert_eq!(mapper.map_to_viseme("Ñ", "es"), Viseme::Dntl);
        assert_eq!(mapper.map_to_viseme("á", "es"), Viseme::A);
    }

    #[test]
    fn french_accented_vowels() {
        let mapper = VisemeMapper::default();
        assert_eq!(mapper.map_to_viseme("è", "fr"), Viseme::E);
        assert_eq!(mapper.map_to_viseme("Ô", "fr"), Viseme::O);
        assert_eq!(mapper.map_to_viseme("qu", "FR"), Viseme::Kg);
    }

    #[test]
    fn unconfigured_language_uses_default_table() {
        let mapper = VisemeMapper::default();
        assert!(!mapper.supports("de"));
        assert_eq!(mapper.map_to_viseme("sh", "de"), Viseme::S);
    }

    #[test]
    fn configured_tables_extend_and_override() {
        let mut extra = BTreeMap::new();
        extra.insert(
            "de".to_owned(),
            BTreeMap::from([("sch".to_owned(), Viseme::S)]),
        );
        extra.insert(
            "en".to_owned(),
            BTreeMap::from([("W".to_owned(), Viseme::U)]),
        );
        let mapper = VisemeMapper::with_tables("en", &extra);
        assert!(mapper.supports("de"));
        assert_eq!(mapper.map_to_viseme("sch", "de"), Viseme::S);
        assert_eq!(mapper.map_to_viseme("w", "en"), Viseme::U);
        assert_eq!(mapper.map_to_viseme("m", "en"), Viseme::Mbp);
    }

    #[test]
    fn sequence_mapping() {
        let mapper = VisemeMapper::default();
        assert_eq!(
            mapper.map_sequence("HH AH0 L OW1", "en"),
            [Viseme::Kg, Viseme::A, Viseme::Dntl, Viseme::O]
        );
    }
}
