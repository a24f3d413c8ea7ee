//! `color` capability: hex color parsing and blending.
//!
//! Colors cross the boundary as `#rrggbb` strings or `{r, g, b, a}` tables
//! with 0-255 channels (`a` defaults to 255).

use mlua::{Lua, Table, Value};

use super::{cap_error, number_arg};

const CAP: &str = "color";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba { r: 255, g: 255, b: 255, a: 255 };
    pub const BLACK: Rgba = Rgba { r: 0, g: 0, b: 0, a: 255 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// `#rrggbb`, or `#rrggbbaa` when not fully opaque.
    pub fn to_hex(self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

/// Parse a color string into RGBA.
///
/// Supported formats:
/// - `#RRGGBB` or `RRGGBB`
/// - `#RRGGBBAA`
/// - `#RGB` (expanded to RRGGBB)
/// - `rgb(R, G, B)` with decimal values
pub fn parse_color(input: &str) -> Option<Rgba> {
    let trimmed = input.trim();

    if let Some(inner) = trimmed.strip_prefix("rgb(").and_then(|s| s.strip_suffix(')')) {
        let parts: Vec<&str> = inner.split(',').collect();
        if parts.len() == 3 {
            let r = parts[0].trim().parse::<u8>().ok()?;
            let g = parts[1].trim().parse::<u8>().ok()?;
            let b = parts[2].trim().parse::<u8>().ok()?;
            return Some(Rgba::new(r, g, b));
        }
        return None;
    }

    let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();

    match hex.len() {
        3 => {
            // #RGB → #RRGGBB
            let r = u8::from_str_radix(&hex[0..1], 16).ok()?;
            let g = u8::from_str_radix(&hex[1..2], 16).ok()?;
            let b = u8::from_str_radix(&hex[2..3], 16).ok()?;
            Some(Rgba::new(r * 17, g * 17, b * 17))
        }
        6 => Some(Rgba::new(channel(0)?, channel(2)?, channel(4)?)),
        8 => Some(Rgba {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
            a: channel(6)?,
        }),
        _ => None,
    }
}

/// Linear blend of `a` toward `b` by `t` (clamped to 0..=1).
pub fn mix(a: Rgba, b: Rgba, t: f64) -> Rgba {
    let t = t.clamp(0.0, 1.0);
    let lerp = |x: u8, y: u8| (x as f64 + (y as f64 - x as f64) * t).round() as u8;
    Rgba {
        r: lerp(a.r, b.r),
        g: lerp(a.g, b.g),
        b: lerp(a.b, b.b),
        a: lerp(a.a, b.a),
    }
}

/// Lighten a color by mixing with white
pub fn lighten(color: Rgba, amount: f64) -> Rgba {
    Rgba { a: color.a, ..mix(color, Rgba::WHITE, amount) }
}

/// Darken a color by mixing with black
pub fn darken(color: Rgba, amount: f64) -> Rgba {
    Rgba { a: color.a, ..mix(color, Rgba::BLACK, amount) }
}

/// WCAG relative luminance (0.0 black .. 1.0 white).
pub fn luminance(color: Rgba) -> f64 {
    let linear = |c: u8| {
        let c = c as f64 / 255.0;
        if c <= 0.03928 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    0.2126 * linear(color.r) + 0.7152 * linear(color.g) + 0.0722 * linear(color.b)
}

/// WCAG contrast ratio between two colors (1.0 ..= 21.0).
pub fn contrast(a: Rgba, b: Rgba) -> f64 {
    let (la, lb) = (luminance(a), luminance(b));
    let (hi, lo) = if la >= lb { (la, lb) } else { (lb, la) };
    (hi + 0.05) / (lo + 0.05)
}

fn channel_value(table: &Table, key: &str, default: Option<u8>) -> mlua::Result<u8> {
    let value: Value = table.get(key)?;
    if value.is_nil() {
        return default.ok_or_else(|| cap_error(CAP, format!("color table is missing '{}'", key)));
    }
    let n = number_arg(CAP, key, &value)?;
    if !(0.0..=255.0).contains(&n) {
        return Err(cap_error(CAP, format!("channel '{}' must be within 0-255", key)));
    }
    Ok(n.round() as u8)
}

fn color_arg(value: &Value) -> mlua::Result<Rgba> {
    match value {
        Value::String(s) => {
            let text = s.to_string_lossy().to_string();
            parse_color(&text).ok_or_else(|| cap_error(CAP, format!("invalid color '{}'", text)))
        }
        Value::Table(t) => Ok(Rgba {
            r: channel_value(t, "r", None)?,
            g: channel_value(t, "g", None)?,
            b: channel_value(t, "b", None)?,
            a: channel_value(t, "a", Some(255))?,
        }),
        other => Err(cap_error(
            CAP,
            format!("expected a color string or table, got {}", other.type_name()),
        )),
    }
}

fn color_table(lua: &Lua, color: Rgba) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("r", color.r)?;
    t.set("g", color.g)?;
    t.set("b", color.b)?;
    t.set("a", color.a)?;
    Ok(t)
}

pub(crate) fn create_table(lua: &Lua) -> mlua::Result<Table> {
    let color = lua.create_table()?;

    color.set(
        "parse",
        lua.create_function(|lua, s: String| match parse_color(&s) {
            Some(c) => Ok(Value::Table(color_table(lua, c)?)),
            None => Ok(Value::Nil),
        })?,
    )?;

    // color.hex(r, g, b) or color.hex({ r = .., g = .., b = .. })
    color.set(
        "hex",
        lua.create_function(|_, args: mlua::MultiValue| {
            let args: Vec<Value> = args.into_iter().collect();
            let c = match args.as_slice() {
                [single] => color_arg(single)?,
                [r, g, b, ..] => {
                    let t = [r, g, b]
                        .iter()
                        .map(|v| number_arg(CAP, "channel", v))
                        .collect::<mlua::Result<Vec<f64>>>()?;
                    if t.iter().any(|n| !(0.0..=255.0).contains(n)) {
                        return Err(cap_error(CAP, "channels must be within 0-255"));
                    }
                    Rgba::new(t[0].round() as u8, t[1].round() as u8, t[2].round() as u8)
                }
                _ => return Err(cap_error(CAP, "hex expects a color or three channels")),
            };
            Ok(c.to_hex())
        })?,
    )?;

    color.set(
        "lighten",
        lua.create_function(|_, (c, amount): (Value, Value)| {
            Ok(lighten(color_arg(&c)?, number_arg(CAP, "amount", &amount)?).to_hex())
        })?,
    )?;

    color.set(
        "darken",
        lua.create_function(|_, (c, amount): (Value, Value)| {
            Ok(darken(color_arg(&c)?, number_arg(CAP, "amount", &amount)?).to_hex())
        })?,
    )?;

    color.set(
        "mix",
        lua.create_function(|_, (a, b, t): (Value, Value, Option<Value>)| {
            let t = match t {
                Some(v) => number_arg(CAP, "t", &v)?,
                None => 0.5,
            };
            Ok(mix(color_arg(&a)?, color_arg(&b)?, t).to_hex())
        })?,
    )?;

    color.set(
        "luminance",
        lua.create_function(|_, c: Value| Ok(luminance(color_arg(&c)?)))?,
    )?;

    color.set(
        "contrast",
        lua.create_function(|_, (a, b): (Value, Value)| Ok(contrast(color_arg(&a)?, color_arg(&b)?)))?,
    )?;

    Ok(color)
}
