//! Component identifier derivation.
//!
//! Page file stems become client-side constructor names, so they must be
//! valid JS identifiers: kebab-case turns into PascalCase, illegal
//! characters are dropped, and a leading digit gets an underscore prefix.

/// Derive a component identifier from a file stem.
///
/// `"my-page"` becomes `"MyPage"`, `"index"` becomes `"Index"`,
/// `"404"` becomes `"_404"`.
pub fn component_ident(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut upper_next = true;

    for c in stem.chars() {
        if c == '-' {
            upper_next = true;
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }

    if out.is_empty() {
        return "Component".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_simple() {
        assert_eq!(component_ident("index"), "Index");
        assert_eq!(component_ident("about"), "About");
    }

    #[test]
    fn test_ident_kebab_to_pascal() {
        assert_eq!(component_ident("my-page"), "MyPage");
        assert_eq!(component_ident("a-b-c"), "ABC");
    }

    #[test]
    fn test_ident_strips_illegal_chars() {
        assert_eq!(component_ident("foo.bar"), "Foobar");
        assert_eq!(component_ident("user profile"), "Userprofile");
    }

    #[test]
    fn test_ident_leading_digit() {
        assert_eq!(component_ident("404"), "_404");
    }

    #[test]
    fn test_ident_empty_fallback() {
        assert_eq!(component_ident(""), "Component");
        assert_eq!(component_ident("---"), "Component");
    }
}
