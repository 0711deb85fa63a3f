//! Script-aware tokenizer for mixed Latin / Japanese catalog text.
//!
//! Latin letters and digits form word tokens. Han, kana and hangul runs carry no
//! word delimiters, so they are split into overlapping character bigrams
//! (a lone character becomes a unigram). Everything else separates runs.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CharClass {
    Word,
    Ideographic,
    Separator,
}

fn classify(ch: char) -> CharClass {
    if is_ideographic(ch) {
        CharClass::Ideographic
    } else if ch.is_alphanumeric() {
        CharClass::Word
    } else {
        CharClass::Separator
    }
}

fn is_ideographic(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3040..=0x309F     // hiragana
            | 0x30A0..=0x30FF   // katakana, including the prolonged sound mark
            | 0x31F0..=0x31FF   // katakana phonetic extensions
            | 0x3400..=0x4DBF   // CJK extension A
            | 0x4E00..=0x9FFF   // CJK unified ideographs
            | 0xF900..=0xFAFF   // CJK compatibility ideographs
            | 0xFF66..=0xFF9F   // halfwidth katakana
            | 0xAC00..=0xD7AF   // hangul syllables
            | 0x20000..=0x2A6DF // CJK extension B
    )
}

/// Fullwidth ASCII (`Ｎｉｋｅ`, `４Ｋ`) folds to its halfwidth form.
fn fold_width(ch: char) -> char {
    match ch as u32 {
        code @ 0xFF01..=0xFF5E => char::from_u32(code - 0xFEE0).unwrap_or(ch),
        0x3000 => ' ',
        _ => ch,
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut run: Vec<char> = Vec::new();
    let mut run_class = CharClass::Separator;

    let normalized = text.chars().map(fold_width).flat_map(char::to_lowercase);
    for ch in normalized {
        let class = classify(ch);
        if class != run_class {
            flush_run(&mut tokens, &run, run_class);
            run.clear();
            run_class = class;
        }
        if class != CharClass::Separator {
            run.push(ch);
        }
    }
    flush_run(&mut tokens, &run, run_class);

    tokens
}

fn flush_run(tokens: &mut Vec<String>, run: &[char], class: CharClass) {
    match class {
        CharClass::Separator => {}
        _ if run.is_empty() => {}
        CharClass::Word => tokens.push(run.iter().collect()),
        CharClass::Ideographic if run.len() == 1 => tokens.push(run[0].to_string()),
        CharClass::Ideographic => {
            tokens.extend(run.windows(2).map(|pair| pair.iter().collect::<String>()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tokenize;

    #[test]
    fn latin_text_splits_on_whitespace_and_punctuation() {
        assert_eq!(tokenize("Nike Air-Max, 2024!"), vec!["nike", "air", "max", "2024"]);
    }

    #[test]
    fn japanese_runs_become_overlapping_bigrams() {
        assert_eq!(tokenize("スニーカー"), vec!["スニ", "ニー", "ーカ", "カー"]);
        assert_eq!(tokenize("靴"), vec!["靴"]);
    }

    #[test]
    fn mixed_script_text_switches_tokenization_per_run() {
        assert_eq!(
            tokenize("Nikeの靴 USB-C対応"),
            vec!["nike", "の靴", "usb", "c", "対応"]
        );
    }

    #[test]
    fn fullwidth_ascii_folds_to_halfwidth() {
        assert_eq!(tokenize("Ｎｉｋｅ　４Ｋ"), vec!["nike", "4k"]);
    }

    #[test]
    fn empty_and_punctuation_only_input_yield_nothing() {
        assert!(tokenize("").is_empty());
        assert!(tokenize(" 、。!? ").is_empty());
    }
}
