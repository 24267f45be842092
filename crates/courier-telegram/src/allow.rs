//! Allowlist enforcement. Deny-by-default: an empty list admits no one.
//! `"*"` admits everyone; entries match Telegram usernames (with or without
//! the leading `@`) or numeric user IDs.

pub fn is_allowed(allow_users: &[String], username: &str, user_id: &str) -> bool {
    if allow_users.is_empty() {
        return false;
    }
    allow_users.iter().any(|entry| {
        let entry = entry.trim_start_matches('@');
        entry == "*" || entry == username || entry == user_id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_list_denies_everyone() {
        assert!(!is_allowed(&[], "alice", "111"));
    }

    #[test]
    fn wildcard_admits_everyone() {
        let l = list(&["*"]);
        assert!(is_allowed(&l, "alice", "111"));
        assert!(is_allowed(&l, "", "999"));
    }

    #[test]
    fn username_with_and_without_at() {
        assert!(is_allowed(&list(&["alice"]), "alice", "1"));
        assert!(is_allowed(&list(&["@alice"]), "alice", "1"));
        assert!(!is_allowed(&list(&["alice"]), "bob", "2"));
    }

    #[test]
    fn numeric_id_match() {
        let l = list(&["123456789"]);
        assert!(is_allowed(&l, "", "123456789"));
        assert!(!is_allowed(&l, "alice", "111"));
    }

    #[test]
    fn any_entry_admits() {
        let l = list(&["alice", "987"]);
        assert!(is_allowed(&l, "bob", "987"));
        assert!(!is_allowed(&l, "charlie", "0"));
    }
}
