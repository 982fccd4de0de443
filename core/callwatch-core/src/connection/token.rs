/// Structural pre-flight check on a bearer credential: non-empty and made of
/// exactly three non-empty dot-separated parts. This is a shape guard only;
/// the backend does the authentication.
pub fn is_token_shaped(token: &str) -> bool {
    let token = token.trim();
    if token.is_empty() {
        return false;
    }
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 3 && parts.iter().all(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_three_part_tokens() {
        assert!(is_token_shaped("aaa.bbb.ccc"));
        assert!(is_token_shaped(" eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig "));
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(!is_token_shaped(""));
        assert!(!is_token_shaped("   "));
        assert!(!is_token_shaped("opaque-token"));
        assert!(!is_token_shaped("a.b"));
        assert!(!is_token_shaped("a.b.c.d"));
        assert!(!is_token_shaped("a..c"));
        assert!(!is_token_shaped(".b.c"));
    }
}
