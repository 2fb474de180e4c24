use std::collections::HashMap;

use crate::config::{CharactersConfig, GlowTtsTrainingConfig};

const PAD: &str = "_";
const EOS: &str = "~";
const BOS: &str = "^";
const CHARACTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!'(),-.:;? ";
const PUNCTUATIONS: &str = "!'(),-.:;? ";

// IPA inventory: vowels, non-pulmonic and pulmonic consonants, suprasegmentals,
// other symbols and diacritics
const PHONEMES: &str = concat!(
    "iyɨʉɯuɪʏʊeøɘəɵɤoɛœɜɞʌɔæɐaɶɑɒᵻ",
    "ʘɓǀɗǃʄǂɠǁʛ",
    "pbtdʈɖcɟkɡqɢʔɴŋɲɳnɱmʙrʀⱱɾɽɸβfvθðszʃʒʂʐçʝxɣχʁħʕhɦɬɮʋɹɻjɰlɭʎʟ",
    "ˈˌːˑ",
    "ʍwɥʜʢʡɕʑɺɧ",
    "ɚ˞ɫ",
);

/// Turns a sentence into model input ids
pub trait TextEncoder {
    fn encode(&self, text: &str) -> Vec<i64>;
}

/// Symbol inventory the model embeds, fixed for the whole run
#[derive(Debug, Clone)]
pub struct CharacterSet {
    symbols: Vec<String>,
    symbol_to_id: HashMap<char, usize>,
    add_blank: bool,
}

impl CharacterSet {
    /// Build the grapheme or phoneme inventory selected by the config
    pub fn from_config(config: &GlowTtsTrainingConfig) -> Self {
        let set = match &config.characters {
            Some(custom) => Self::from_characters_config(custom, config.use_phonemes),
            None if config.use_phonemes => {
                Self::phonemes(PAD, EOS, BOS, PUNCTUATIONS, PHONEMES)
            }
            None => Self::graphemes(PAD, EOS, BOS, CHARACTERS),
        };
        set.with_blank(config.add_blank)
    }

    fn from_characters_config(custom: &CharactersConfig, use_phonemes: bool) -> Self {
        if use_phonemes {
            Self::phonemes(
                &custom.pad,
                &custom.eos,
                &custom.bos,
                &custom.punctuations,
                &custom.phonemes,
            )
        } else {
            Self::graphemes(&custom.pad, &custom.eos, &custom.bos, &custom.characters)
        }
    }

    /// Special symbols followed by the characters, duplicates dropped
    pub fn graphemes(pad: &str, eos: &str, bos: &str, characters: &str) -> Self {
        let mut symbols = special_symbols(pad, eos, bos);
        for c in characters.chars() {
            let s = c.to_string();
            if !symbols.contains(&s) {
                symbols.push(s);
            }
        }
        Self::from_symbols(symbols)
    }

    /// Special symbols followed by the sorted, unique punctuation and phonemes
    pub fn phonemes(pad: &str, eos: &str, bos: &str, punctuations: &str, phonemes: &str) -> Self {
        let mut inventory: Vec<char> = punctuations.chars().chain(phonemes.chars()).collect();
        inventory.sort_unstable();
        inventory.dedup();

        let mut symbols = special_symbols(pad, eos, bos);
        symbols.extend(inventory.into_iter().map(|c| c.to_string()));
        Self::from_symbols(symbols)
    }

    fn from_symbols(symbols: Vec<String>) -> Self {
        let symbol_to_id = symbols
            .iter()
            .enumerate()
            .filter_map(|(id, s)| {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some((c, id)),
                    _ => None,
                }
            })
            .collect();

        Self {
            symbols,
            symbol_to_id,
            add_blank: false,
        }
    }

    /// Intersperse the blank id between encoded symbols
    pub fn with_blank(mut self, add_blank: bool) -> Self {
        self.add_blank = add_blank;
        self
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Number of input ids the model must embed, blank included
    pub fn num_chars(&self) -> usize {
        if self.add_blank {
            self.symbols.len() + 1
        } else {
            self.symbols.len()
        }
    }

    fn blank_id(&self) -> i64 {
        self.symbols.len() as i64
    }
}

impl TextEncoder for CharacterSet {
    fn encode(&self, text: &str) -> Vec<i64> {
        let ids: Vec<i64> = text
            .chars()
            .filter_map(|c| self.symbol_to_id.get(&c).map(|&id| id as i64))
            .collect();

        if !self.add_blank || ids.is_empty() {
            return ids;
        }

        let blank = self.blank_id();
        let mut interspersed = Vec::with_capacity(ids.len() * 2 + 1);
        interspersed.push(blank);
        for id in ids {
            interspersed.push(id);
            interspersed.push(blank);
        }
        interspersed
    }
}

fn special_symbols(pad: &str, eos: &str, bos: &str) -> Vec<String> {
    [pad, eos, bos]
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
