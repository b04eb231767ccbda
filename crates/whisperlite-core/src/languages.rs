/// A language both the speech model and the translator know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
}

const fn lang(code: &'static str, name: &'static str) -> Language {
    Language { code, name }
}

pub const ENGLISH: Language = lang("en", "English");

pub const LANGUAGES: &[Language] = &[
    lang("af", "Afrikaans"),
    lang("ar", "Arabic"),
    lang("az", "Azerbaijani"),
    lang("bg", "Bulgarian"),
    lang("ca", "Catalan"),
    lang("cs", "Czech"),
    lang("da", "Danish"),
    lang("de", "German"),
    lang("el", "Greek"),
    ENGLISH,
    lang("es", "Spanish"),
    lang("fa", "Persian"),
    lang("fi", "Finnish"),
    lang("fr", "French"),
    lang("he", "Hebrew"),
    lang("hi", "Hindi"),
    lang("hr", "Croatian"),
    lang("hu", "Hungarian"),
    lang("id", "Indonesian"),
    lang("it", "Italian"),
    lang("ja", "Japanese"),
    lang("ko", "Korean"),
    lang("nl", "Dutch"),
    lang("no", "Norwegian"),
    lang("pl", "Polish"),
    lang("pt", "Portuguese"),
    lang("ro", "Romanian"),
    lang("ru", "Russian"),
    lang("sk", "Slovak"),
    lang("sr", "Serbian"),
    lang("sv", "Swedish"),
    lang("th", "Thai"),
    lang("tr", "Turkish"),
    lang("uk", "Ukrainian"),
    lang("ur", "Urdu"),
    lang("vi", "Vietnamese"),
    lang("zh", "Chinese"),
];

pub fn by_code(code: &str) -> Option<&'static Language> {
    LANGUAGES.iter().find(|l| l.code == code)
}

/// Accepts a code (`de`) or a name (`german`, any case).
pub fn find(code_or_name: &str) -> Option<&'static Language> {
    let q = code_or_name.trim();
    by_code(&q.to_ascii_lowercase())
        .or_else(|| LANGUAGES.iter().find(|l| l.name.eq_ignore_ascii_case(q)))
}

/// Display name for a detected language code, or the code itself.
pub fn display_name(code: &str) -> &str {
    by_code(code).map_or(code, |l| l.name)
}
