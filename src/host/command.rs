//!
//! Immutable, validated representation of a single G-code instruction.
//!

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::CommandError;

/// Matches a parenthesised inline comment, non-greedy.
static RE_INLINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(.*?\)").unwrap());

/// Matches a semicolon line comment, to end of line.
static RE_LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m);.*$").unwrap());

///
/// A single G-code command ready for transmission.
///
/// Encapsulates a line number and transmission settings alongside the instruction
/// string. Construction normalizes the raw G-code (stripping comments and whitespace,
/// folding carriage returns, uppercasing) and rejects anything that isn't exactly one
/// non-empty instruction.
///
/// # Fields:
/// - `line_number`: Line number assigned to this command.
/// - `instruction`: The normalized G-code instruction string.
/// - `signed`: Whether `format_line` should append a line number and checksum.
///
#[derive(Clone, Debug, PartialEq, Eq, getset::Getters, getset::CopyGetters)]
pub struct Command {
    #[getset(get_copy = "pub")]
    line_number: u32,
    #[getset(get = "pub")]
    instruction: String,
    #[getset(get_copy = "pub")]
    signed: bool,
}

impl Command {
    ///
    /// Constructs a new `Command`, normalizing and validating `raw_gcode`.
    ///
    /// # Parameters:
    /// - `line_number`: The line number to assign to this command.
    /// - `raw_gcode`: The raw, unnormalized G-code instruction.
    /// - `signed`: Whether the command should be checksummed on transmission.
    ///
    /// # Returns:
    /// - A `Command` with a non-empty, single-line, normalized instruction.
    /// - `CommandError::EmptyCommand` if the result of normalization is empty.
    /// - `CommandError::MultipleCommands` if normalization leaves more than one line.
    ///
    pub fn new(line_number: u32, raw_gcode: &str, signed: bool) -> Result<Self, CommandError> {
        if raw_gcode.is_empty() {
            return Err(CommandError::EmptyCommand);
        }

        let clean = Self::normalize_gcode(raw_gcode);

        if clean.contains('\n') {
            return Err(CommandError::MultipleCommands);
        }

        if clean.is_empty() {
            return Err(CommandError::EmptyCommand);
        }

        Ok(Command { line_number, instruction: clean, signed })
    }

    ///
    /// Formats the command for transmission over the wire.
    ///
    /// # Returns:
    /// - The normalized instruction as-is, if `signed` is false.
    /// - `"N{line_number} {instruction}*{checksum}"`, if `signed` is true.
    ///
    pub fn format_line(&self) -> String {
        if !self.signed {
            return self.instruction.clone();
        }

        self.format_with_checksum()
    }

    fn format_with_checksum(&self) -> String {
        let numbered_line = format!("N{} {}", self.line_number, self.instruction);
        let checksum = xor_checksum(&numbered_line);
        format!("{}*{}", numbered_line, checksum)
    }

    /// Normalizes a raw G-code line for transmission: folds `\r` to `\n`, strips
    /// inline and line comments, trims, and uppercases. May contain embedded newlines
    /// if multiple commands were given; the caller rejects that case.
    fn normalize_gcode(raw_gcode: &str) -> String {
        let folded = raw_gcode.replace('\r', "\n");
        let no_inline = RE_INLINE_COMMENT.replace_all(&folded, "");
        let no_line_comments = RE_LINE_COMMENT.replace_all(&no_inline, "");
        no_line_comments.trim().to_uppercase()
    }
}

/// Computes the byte-wise XOR checksum of a line's ASCII bytes.
pub(crate) fn xor_checksum(line: &str) -> u8 {
    line.bytes().fold(0u8, |acc, byte| acc ^ byte)
}
