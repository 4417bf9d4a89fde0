use std::borrow::Borrow;
use std::fmt;

/// A path could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path {0:?}")]
pub struct InvalidPath(pub String);

/// A slash-separated, hierarchical identifier for a graph object.
///
/// A valid path starts with `/`, and every segment after that is a
/// symbol: ASCII letters, digits and `_`, not starting with a digit.
/// The root path is `/`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(String);

impl Path {
    pub fn root() -> Self {
        Self(String::from("/"))
    }

    pub fn new(path: impl Into<String>) -> Result<Self, InvalidPath> {
        let path: String = path.into();

        if path == "/" {
            return Ok(Self(path));
        }

        let Some(rest) = path.strip_prefix('/') else {
            return Err(InvalidPath(path));
        };

        if !rest.split('/').all(is_valid_symbol) {
            return Err(InvalidPath(path));
        }

        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The last segment of the path, or an empty string for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(i) => &self.0[i + 1..],
            None => "",
        }
    }

    /// The path of the parent object, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(i) => Some(Self(self.0[..i].to_string())),
            None => None,
        }
    }

    pub fn child(&self, symbol: &str) -> Result<Path, InvalidPath> {
        if !is_valid_symbol(symbol) {
            return Err(InvalidPath(format!("{}/{}", self.0, symbol)));
        }

        if self.is_root() {
            Ok(Self(format!("/{}", symbol)))
        } else {
            Ok(Self(format!("{}/{}", self.0, symbol)))
        }
    }

    pub fn is_child_of(&self, parent: &Path) -> bool {
        self.parent().as_ref() == Some(parent)
    }

    /// Returns `true` if `ancestor` is a strict prefix of this path.
    pub fn is_descendant_of(&self, ancestor: &Path) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }

        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// The half-open key range `[lower, upper)` that contains every
    /// descendant of this path in lexicographic order.
    ///
    /// Returns `None` for the upper bound when the range is unbounded.
    pub fn descendant_bounds(&self) -> (String, Option<String>) {
        if self.is_root() {
            // Everything sorts after "/" itself.
            return (String::from("/\0"), None);
        }

        // '0' is the character right after '/'.
        (format!("{}/", self.0), Some(format!("{}0", self.0)))
    }
}

fn is_valid_symbol(symbol: &str) -> bool {
    let mut bytes = symbol.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Borrow<str> for Path {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl TryFrom<&str> for Path {
    type Error = InvalidPath;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_paths() {
        assert!(Path::new("/").unwrap().is_root());
        assert!(Path::new("/main/osc").is_ok());
        assert!(Path::new("/main/osc_1/out").is_ok());
        assert!(Path::new("/_a/B9").is_ok());

        assert!(Path::new("").is_err());
        assert!(Path::new("main").is_err());
        assert!(Path::new("/main/").is_err());
        assert!(Path::new("//main").is_err());
        assert!(Path::new("/ma in").is_err());
    }

    #[test]
    fn symbols_are_identifiers() {
        for bad in [".", "..", "-x", "x-y", "1x", "a.b", "é"] {
            assert!(Path::new(format!("/{}", bad)).is_err(), "{}", bad);
            assert!(Path::new(format!("/main/{}", bad)).is_err(), "{}", bad);
            assert!(Path::root().child(bad).is_err(), "{}", bad);
        }
        assert!(Path::new("/main/../out").is_err());
        assert!(Path::new("/x1/_2").is_ok());
    }

    #[test]
    fn parent_and_name() {
        let p = Path::new("/main/osc/out").unwrap();
        assert_eq!(p.name(), "out");
        assert_eq!(p.parent().unwrap().as_str(), "/main/osc");
        assert_eq!(
            Path::new("/main").unwrap().parent().unwrap(),
            Path::root()
        );
        assert_eq!(Path::root().parent(), None);
        assert_eq!(Path::root().name(), "");

        assert_eq!(Path::root().child("main").unwrap().as_str(), "/main");
        assert_eq!(p.child("x").unwrap().as_str(), "/main/osc/out/x");
        assert!(p.child("a/b").is_err());
    }

    #[test]
    fn descendants() {
        let main = Path::new("/main").unwrap();

        assert!(Path::new("/main/osc").unwrap().is_descendant_of(&main));
        assert!(Path::new("/main/osc/out").unwrap().is_descendant_of(&main));
        assert!(!Path::new("/main2").unwrap().is_descendant_of(&main));
        assert!(!Path::new("/main_a").unwrap().is_descendant_of(&main));
        assert!(!main.is_descendant_of(&main));
        assert!(main.is_descendant_of(&Path::root()));

        assert!(Path::new("/main/osc").unwrap().is_child_of(&main));
        assert!(!Path::new("/main/osc/out").unwrap().is_child_of(&main));
    }

    #[test]
    fn descendant_bounds_cover_exactly_the_subtree() {
        let main = Path::new("/main").unwrap();
        let (lo, hi) = main.descendant_bounds();
        let hi = hi.unwrap();

        for (p, inside) in [
            ("/main", false),
            ("/main/a", true),
            ("/main/zz/y", true),
            ("/main-a", false),
            ("/main.b", false),
            ("/main0", false),
            ("/mainz", false),
        ] {
            let in_range = p >= lo.as_str() && p < hi.as_str();
            assert_eq!(in_range, inside, "{}", p);
        }
    }
}
