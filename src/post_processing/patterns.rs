//! Regular expressions over generated text.
//!
//! The `regex` crate has no lookahead, so phrase-text patterns consume the
//! terminating marker with a non-capturing group and callers read only
//! capture group 1.

use std::sync::LazyLock;

use regex::Regex;

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        pub(super) static $name: LazyLock<Regex> = LazyLock::new(|| {
            #[expect(clippy::expect_used, reason = "pattern is constant and valid")]
            Regex::new($re).expect("valid regex")
        });
    };
}

pattern!(
    OCR_LINE,
    r"(.+?)<loc_(\d+)><loc_(\d+)><loc_(\d+)><loc_(\d+)><loc_(\d+)><loc_(\d+)><loc_(\d+)><loc_(\d+)>"
);
pattern!(PHRASE, r"([^<]+(?:<loc_\d+>){4,})");
pattern!(PHRASE_ALLOW_EMPTY, r"(?:(?:<loc_\d+>){4,})");
pattern!(
    PHRASE_TEXT,
    r"^\s*(.*?)(?:<od>|</od>|<box>|</box>|<bbox>|</bbox>|<loc_)"
);
pattern!(BOX, r"<loc_(\d+)><loc_(\d+)><loc_(\d+)><loc_(\d+)>");
pattern!(GROUNDING_MARKERS, r"(?i)<ground>|<obj>");
pattern!(LOC, r"<loc_(\d+)>");
pattern!(LEADING_PARTIAL_LOC, r"^loc_\d+>");
pattern!(
    POLYGON_PHRASE,
    r"([^<]+(?:<loc_\d+>|<sep>|<poly>|</poly>){4,})"
);
pattern!(
    POLYGON_PHRASE_ALLOW_EMPTY,
    r"(?:(?:<loc_\d+>|<sep>|<poly>|</poly>){4,})"
);
pattern!(
    POLYGON_PHRASE_TEXT,
    r"^\s*(.*?)(?:<od>|</od>|<box>|</box>|<bbox>|</bbox>|<loc_|<poly>)"
);
pattern!(POLYGON_RUN, r"((?:<loc_\d+>)+)(?:<sep>|$)");
pattern!(POLYGON_INSTANCE, r"<poly>(.*?)</poly>");
