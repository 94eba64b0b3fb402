//! G-code line filtering shared by the Feeder and the Sender.
//!
//! [`translate_line`] is the pure transform applied to every queued line
//! before it reaches the wire: it strips comments, evaluates `%`
//! assignment sentinels, performs `[expr]` substitution, converts `%wait`
//! into a planner-drain dwell, and flags tool-change / program-pause words
//! (`M0`, `M1`, `M6`) for the caller to act on. The caller decides what a
//! pause means — the Feeder holds itself, the Sender raises a program
//! pause.

use crate::context::Context;
use crate::error::Result;

/// Dwell emitted in place of the `%wait` sentinel
pub const WAIT_DWELL: &str = "G4 P0.5";

/// The `%wait` sentinel word
pub const WAIT_SENTINEL: &str = "%wait";

/// Pause-relevant words recognized during filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseWord {
    /// Unconditional program pause
    M0,
    /// Optional program pause
    M1,
    /// Tool change
    M6,
}

impl PauseWord {
    /// The canonical word text
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseWord::M0 => "M0",
            PauseWord::M1 => "M1",
            PauseWord::M6 => "M6",
        }
    }
}

/// Result of filtering one raw line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Translated {
    /// The line to put on the wire, if any. Comment-only lines and `%`
    /// assignments reduce to `None`.
    pub output: Option<String>,
    /// A pause word found in the line
    pub pause: Option<PauseWord>,
    /// True when the line was the `%wait` sentinel
    pub wait: bool,
}

/// Remove `(...)` and `; ...` comments.
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_paren = false;
    for c in line.chars() {
        match c {
            '(' if !in_paren => in_paren = true,
            ')' if in_paren => in_paren = false,
            ';' if !in_paren => break,
            c if !in_paren => out.push(c),
            _ => {}
        }
    }
    out
}

/// Filter one raw line against `ctx`.
///
/// `%name = expr` lines mutate `ctx` and emit nothing. `[expr]` spans are
/// replaced by their evaluated value. Pause words are reported in
/// [`Translated::pause`]; `M6` is additionally wrapped in parentheses so
/// firmwares without tool changers ignore it.
pub fn translate_line(raw: &str, ctx: &mut Context) -> Result<Translated> {
    let stripped = strip_comments(raw);
    let line = stripped.trim();

    if line.is_empty() {
        return Ok(Translated::default());
    }

    if let Some(rest) = line.strip_prefix('%') {
        let rest = rest.trim();
        if rest.eq_ignore_ascii_case("wait") {
            return Ok(Translated {
                output: Some(WAIT_DWELL.to_string()),
                pause: None,
                wait: true,
            });
        }
        if rest.is_empty() {
            // Bare % program demarcation
            return Ok(Translated::default());
        }
        ctx.assign(rest)?;
        return Ok(Translated::default());
    }

    let substituted = substitute(line, ctx)?;
    let (output, pause) = mark_pause_words(&substituted);

    Ok(Translated {
        output: Some(output),
        pause,
        wait: false,
    })
}

/// Replace `[expr]` spans with their evaluated value.
fn substitute(line: &str, ctx: &Context) -> Result<String> {
    if !line.contains('[') {
        return Ok(line.to_string());
    }

    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        match rest[open + 1..].find(']') {
            Some(close) => {
                let expr = &rest[open + 1..open + 1 + close];
                let value = ctx.eval(expr)?;
                out.push_str(&value.to_string());
                rest = &rest[open + close + 2..];
            }
            None => {
                // Unbalanced bracket; keep the remainder verbatim
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Find the first pause word and wrap `M6` in parentheses.
fn mark_pause_words(line: &str) -> (String, Option<PauseWord>) {
    let mut pause = None;
    let mut out = String::with_capacity(line.len() + 2);
    let bytes: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let at_boundary = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        if (c == 'M' || c == 'm') && at_boundary {
            let start = i;
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 {
                let digits: String = bytes[i + 1..j].iter().collect();
                let word: String = bytes[start..j].iter().collect();
                let code = digits.parse::<u32>().unwrap_or(u32::MAX);
                let found = match code {
                    0 => Some(PauseWord::M0),
                    1 => Some(PauseWord::M1),
                    6 => Some(PauseWord::M6),
                    _ => None,
                };
                if let Some(p) = found {
                    if pause.is_none() {
                        pause = Some(p);
                    }
                    if p == PauseWord::M6 {
                        out.push('(');
                        out.push_str(&word);
                        out.push(')');
                        i = j;
                        continue;
                    }
                }
                out.push_str(&word);
                i = j;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }

    (out, pause)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(line: &str) -> Translated {
        translate_line(line, &mut Context::new()).unwrap()
    }

    #[test]
    fn comments_reduce_to_nothing() {
        assert_eq!(t("; just a comment").output, None);
        assert_eq!(t("(comment)").output, None);
        assert_eq!(t("G0 X1 ; move").output, Some("G0 X1".to_string()));
        assert_eq!(t("G0 (inline) X1").output, Some("G0  X1".to_string()));
    }

    #[test]
    fn wait_sentinel_emits_dwell() {
        let r = t("%wait");
        assert_eq!(r.output, Some(WAIT_DWELL.to_string()));
        assert!(r.wait);

        let r = t("%wait ; Wait for the planner to empty");
        assert!(r.wait);
    }

    #[test]
    fn bare_percent_is_ignored() {
        assert_eq!(t("%").output, None);
    }

    #[test]
    fn assignment_mutates_context_and_emits_nothing() {
        let mut ctx = Context::new();
        let r = translate_line("%depth = 2 + 3", &mut ctx).unwrap();
        assert_eq!(r.output, None);
        assert_eq!(ctx.number("depth"), Some(5.0));
    }

    #[test]
    fn bracket_substitution() {
        let mut ctx = Context::new();
        ctx.set("posx", 10.0);
        let r = translate_line("G0 X[posx + 1] Y[posx * 2]", &mut ctx).unwrap();
        assert_eq!(r.output, Some("G0 X11 Y20".to_string()));
    }

    #[test]
    fn pause_words_detected() {
        assert_eq!(t("M0").pause, Some(PauseWord::M0));
        assert_eq!(t("M1").pause, Some(PauseWord::M1));
        assert_eq!(t("M01").pause, Some(PauseWord::M1));
        assert_eq!(t("G0 X1 M0").pause, Some(PauseWord::M0));
        assert_eq!(t("M30").pause, None);
        assert_eq!(t("M60").pause, None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn strip_comments_never_grows(line in ".{0,60}") {
                prop_assert!(strip_comments(&line).len() <= line.len());
            }

            #[test]
            fn plain_gcode_always_translates(line in "[GMXYZF0-9 .]{0,30}") {
                let mut ctx = Context::new();
                let translated = translate_line(&line, &mut ctx).unwrap();
                if let Some(out) = translated.output {
                    prop_assert!(!out.trim().is_empty());
                }
            }
        }
    }

    #[test]
    fn m6_is_wrapped() {
        let r = t("M6");
        assert_eq!(r.output, Some("(M6)".to_string()));
        assert_eq!(r.pause, Some(PauseWord::M6));

        let r = t("T2 M6");
        assert_eq!(r.output, Some("T2 (M6)".to_string()));

        // M66 is not a tool change
        let r = t("M66 P0");
        assert_eq!(r.output, Some("M66 P0".to_string()));
        assert_eq!(r.pause, None);
    }
}
