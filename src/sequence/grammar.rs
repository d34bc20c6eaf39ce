use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use super::ast::{Actuation, Direction, PressureThreshold, RepeatBound, TimerDelay, Token};

const NUMBER: &str = r"[0-9]\.[0-9]+|[1-9][0-9]*(?:\.[0-9]+)?";

static ACTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Z])([+-])$").expect("actuation pattern is valid"));

static TIMER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^(?:TS|(T\+)?({NUMBER})S)$")).expect("timer pattern is valid")
});

static PRESSURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^({NUMBER})BAR$")).expect("pressure pattern is valid")
});

static REPEAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([1-9][0-9]*)|N(?:\+([1-9][0-9]*))?)$").expect("repeat pattern is valid")
});

/// Match a bare token exactly. Prefix matches with trailing text are rejected.
pub fn parse_token(text: &str) -> Option<Token> {
    if let Some(caps) = ACTUATION.captures(text) {
        let label = caps.get(1)?.as_str().chars().next()?;
        let direction = if caps.get(2)?.as_str() == "+" {
            Direction::Extend
        } else {
            Direction::Retract
        };
        return Some(Token::Actuation(Actuation { label, direction }));
    }

    if let Some(caps) = TIMER.captures(text) {
        let delay = match caps.get(2) {
            None => TimerDelay::RuntimeRelative { offset: None },
            Some(number) => {
                let seconds = parse_seconds(number.as_str())?;
                if caps.get(1).is_some() {
                    TimerDelay::RuntimeRelative {
                        offset: Some(seconds),
                    }
                } else {
                    TimerDelay::Fixed(seconds)
                }
            }
        };
        return Some(Token::Timer(delay));
    }

    if let Some(caps) = PRESSURE.captures(text) {
        let bars = caps.get(1)?.as_str().parse::<f64>().ok()?;
        return Some(Token::Pressure(PressureThreshold { bars }));
    }

    None
}

/// Parse the text following `]^`; `None` spec means an unbounded region.
pub fn parse_bound(spec: Option<&str>) -> Option<RepeatBound> {
    let Some(spec) = spec else {
        return Some(RepeatBound::Unbounded);
    };
    let caps = REPEAT.captures(spec)?;
    if let Some(count) = caps.get(1) {
        return count.as_str().parse().ok().map(RepeatBound::Fixed);
    }
    match caps.get(2) {
        Some(offset) => offset
            .as_str()
            .parse()
            .ok()
            .map(RepeatBound::RelativeToRuntimeVar),
        None => Some(RepeatBound::RelativeToRuntimeVar(0)),
    }
}

/// Parse decimal seconds (`1`, `0.25`, `12.5`) without going through floats.
pub fn parse_seconds(text: &str) -> Option<Duration> {
    let (whole, fraction) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (text, ""),
    };
    let secs: u64 = whole.parse().ok()?;
    let mut digits: String = fraction.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    let nanos: u32 = digits.parse().ok()?;
    Some(Duration::new(secs, nanos))
}
