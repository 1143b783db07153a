//! Authoritative pixel grid.
//!
//! Layout:
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ cells: Vec<u8>, row-major, width × height  │
//! │                                            │
//! │ index = y * width + x                      │
//! │ code 0      → Unset                        │
//! │ code 1..=N  → palette[code - 1]            │
//! └────────────────────────────────────────────┘
//! ```
//!
//! `Grid::apply_write` is the only mutation path once the canvas is live.
//! The grid has no locking of its own; `Canvas` owns it behind a single mutex.

/// Largest grid accepted (64 Mi cells, one byte each).
pub const MAX_CELLS: u64 = 64 * 1024 * 1024;

/// Palette codes are stored in one byte, 0 is reserved for unset.
pub const MAX_PALETTE_LEN: usize = 255;

/// Colors offered by the web client.
pub const DEFAULT_PALETTE: &[&str] = &[
    "#ffffff", "#c0c0c0", "#808080", "#000000",
    "#ff0000", "#800000", "#ffff00", "#808000",
    "#00ff00", "#008000", "#00ffff", "#008080",
    "#0000ff", "#000080", "#ff00ff", "#800080",
    "#ffa500", "#a52a2a",
];

/// Value held by one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorValue {
    #[default]
    Unset,
    /// 1-based palette code
    Color(u8),
}

impl ColorValue {
    /// Decode a stored byte.
    pub fn from_code(code: u8) -> Self {
        if code == 0 {
            ColorValue::Unset
        } else {
            ColorValue::Color(code)
        }
    }

    /// Encode to the stored byte.
    pub fn code(self) -> u8 {
        match self {
            ColorValue::Unset => 0,
            ColorValue::Color(code) => code,
        }
    }

    pub fn is_unset(self) -> bool {
        matches!(self, ColorValue::Unset)
    }
}

/// Errors building a palette.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaletteError {
    Empty,
    TooLarge(usize),
    InvalidHex(String),
}

impl std::fmt::Display for PaletteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaletteError::Empty => write!(f, "Palette must contain at least one color"),
            PaletteError::TooLarge(n) => {
                write!(f, "Palette has {n} colors, at most {MAX_PALETTE_LEN} are supported")
            }
            PaletteError::InvalidHex(s) => write!(f, "Invalid palette color '{s}', expected #rrggbb"),
        }
    }
}

impl std::error::Error for PaletteError {}

/// Closed, ordered set of `#rrggbb` colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<String>,
}

impl Palette {
    /// Build a palette, normalizing every entry to lowercase `#rrggbb`.
    pub fn new<I, S>(colors: I) -> Result<Self, PaletteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let colors = colors
            .into_iter()
            .map(|c| normalize_hex(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        if colors.is_empty() {
            return Err(PaletteError::Empty);
        }
        if colors.len() > MAX_PALETTE_LEN {
            return Err(PaletteError::TooLarge(colors.len()));
        }
        Ok(Self { colors })
    }

    /// Parse a comma-separated list such as `#ff0000,#00ff00`.
    pub fn parse_list(list: &str) -> Result<Self, PaletteError> {
        Self::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn colors(&self) -> &[String] {
        &self.colors
    }

    /// Hex string for a color, `None` for unset or unknown codes.
    pub fn hex(&self, color: ColorValue) -> Option<&str> {
        match color {
            ColorValue::Unset => None,
            ColorValue::Color(0) => None,
            ColorValue::Color(code) => self.colors.get(code as usize - 1).map(String::as_str),
        }
    }

    /// Whether `color` is a writable palette entry.
    pub fn contains(&self, color: ColorValue) -> bool {
        match color {
            ColorValue::Unset => false,
            ColorValue::Color(code) => code != 0 && (code as usize) <= self.colors.len(),
        }
    }

    /// Resolve a numeric wire color.
    pub fn by_code(&self, code: u64) -> Result<ColorValue, GridError> {
        match u8::try_from(code) {
            Ok(c) if c != 0 && (c as usize) <= self.colors.len() => Ok(ColorValue::Color(c)),
            _ => Err(GridError::InvalidColor),
        }
    }

    /// Resolve a hex wire color (case-insensitive).
    pub fn by_hex(&self, hex: &str) -> Result<ColorValue, GridError> {
        let wanted = normalize_hex(hex).map_err(|_| GridError::InvalidColor)?;
        self.colors
            .iter()
            .position(|c| *c == wanted)
            .map(|i| ColorValue::Color(i as u8 + 1))
            .ok_or(GridError::InvalidColor)
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

fn normalize_hex(raw: &str) -> Result<String, PaletteError> {
    let digits = raw
        .strip_prefix('#')
        .ok_or_else(|| PaletteError::InvalidHex(raw.to_string()))?;
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PaletteError::InvalidHex(raw.to_string()));
    }
    Ok(format!("#{}", digits.to_ascii_lowercase()))
}

/// Rejections produced by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridError {
    /// Coordinates outside `[0, width) × [0, height)`
    OutOfBounds { x: i64, y: i64 },
    /// Unset or not part of the palette
    InvalidColor,
    /// Zero-sized, oversized, or mismatched buffer
    InvalidDimensions { width: u32, height: u32 },
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GridError::OutOfBounds { x, y } => write!(f, "Coordinates ({x}, {y}) are out of bounds"),
            GridError::InvalidColor => write!(f, "Color is not part of the palette"),
            GridError::InvalidDimensions { width, height } => {
                write!(f, "Invalid grid dimensions {width}x{height}")
            }
        }
    }
}

impl std::error::Error for GridError {}

/// A write that made it into the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub x: u32,
    pub y: u32,
    pub color: ColorValue,
}

/// Immutable copy of the whole grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSnapshot {
    pub width: u32,
    pub height: u32,
    pub cells: Vec<u8>,
}

impl GridSnapshot {
    pub fn get(&self, x: u32, y: u32) -> Option<ColorValue> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        self.cells.get(index).copied().map(ColorValue::from_code)
    }

    /// Number of cells holding a color.
    pub fn painted(&self) -> usize {
        self.cells.iter().filter(|c| **c != 0).count()
    }
}

/// The canvas buffer.
#[derive(Debug, Clone)]
pub struct Grid {
    width: u32,
    height: u32,
    palette: Palette,
    cells: Vec<u8>,
}

impl Grid {
    /// Create an all-unset grid.
    pub fn new(width: u32, height: u32, palette: Palette) -> Result<Self, GridError> {
        let cells = width as u64 * height as u64;
        if width == 0 || height == 0 || cells > MAX_CELLS {
            return Err(GridError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            palette,
            cells: vec![0; cells as usize],
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }

    pub fn get(&self, x: i64, y: i64) -> Option<ColorValue> {
        self.index(x, y).map(|i| ColorValue::from_code(self.cells[i]))
    }

    /// Set one cell. Bounds and palette membership are the only checks.
    pub fn apply_write(&mut self, x: i64, y: i64, color: ColorValue) -> Result<Committed, GridError> {
        let index = self.index(x, y).ok_or(GridError::OutOfBounds { x, y })?;
        if !self.palette.contains(color) {
            return Err(GridError::InvalidColor);
        }
        self.cells[index] = color.code();
        Ok(Committed {
            x: x as u32,
            y: y as u32,
            color,
        })
    }

    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot {
            width: self.width,
            height: self.height,
            cells: self.cells.clone(),
        }
    }

    /// Replace the buffer with persisted cells. Unknown codes are cleared.
    pub fn restore(&mut self, cells: &[u8]) -> Result<usize, GridError> {
        if cells.len() != self.cells.len() {
            return Err(GridError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let mut cleared = 0;
        for (dst, &code) in self.cells.iter_mut().zip(cells) {
            if code as usize > self.palette.len() {
                *dst = 0;
                cleared += 1;
            } else {
                *dst = code;
            }
        }
        Ok(cleared)
    }
}
