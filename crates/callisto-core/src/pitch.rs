//! Note names to MIDI note numbers.
//!
//! A note name is a letter `a`-`g`, any number of accidentals (`#` or `s`
//! for sharp, `b` for flat, `n` for natural) and an optional octave, which
//! defaults to 4. Middle C is `c4` = 60.

/// Parse a note name to a MIDI note number.
///
/// Returns `None` for malformed names and for notes outside `0..=127`.
pub fn note_number(name: &str) -> Option<u8> {
    let name = name.trim();
    let mut chars = name.chars().peekable();

    let base: i16 = match chars.next()?.to_ascii_lowercase() {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };

    let mut accidental = 0i16;
    while let Some(&c) = chars.peek() {
        match c {
            '#' | 's' | '♯' => accidental += 1,
            'b' | '♭' => accidental -= 1,
            'n' => {}
            _ => break,
        }
        chars.next();
    }

    let octave_str: String = chars.collect();
    let octave: i16 = if octave_str.is_empty() {
        4
    } else {
        octave_str.parse().ok()?
    };

    let midi = (octave + 1) * 12 + base + accidental;
    u8::try_from(midi).ok().filter(|note| *note <= 127)
}
