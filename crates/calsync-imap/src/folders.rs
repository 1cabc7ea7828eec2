use crate::source::FolderSelection;
use tracing::warn;

/// Resolve folder selections into the concrete mailbox folder list.
///
/// `available` is the server's LIST result as (delimiter, name) pairs;
/// subfolder inclusion walks names prefixed with `<base><delimiter>`.
pub fn expand_folders(
    selections: &[FolderSelection],
    available: &[(Option<String>, String)],
) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for selection in selections {
        let base = selection.name.clone();
        if seen.insert(base.clone()) {
            resolved.push(base.clone());
        }
        if !selection.include_subfolders {
            continue;
        }

        let mut matched_subfolders = false;
        for (delimiter, candidate) in available {
            if candidate == &base {
                matched_subfolders = true;
                continue;
            }
            let prefix = format!("{base}{}", delimiter.as_deref().unwrap_or("/"));
            if candidate.starts_with(&prefix) && seen.insert(candidate.clone()) {
                resolved.push(candidate.clone());
                matched_subfolders = true;
            }
        }

        if !matched_subfolders && !available.iter().any(|(_, name)| name == &base) {
            warn!("IMAP Ordner {base} wurde nicht gefunden");
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Vec<(Option<String>, String)> {
        vec![
            (Some("/".to_string()), "INBOX".to_string()),
            (Some("/".to_string()), "INBOX/Termine".to_string()),
            (Some("/".to_string()), "INBOX/Termine/2024".to_string()),
            (Some("/".to_string()), "Archiv".to_string()),
            (Some(".".to_string()), "Projekte.Intern".to_string()),
            (Some(".".to_string()), "Projekte".to_string()),
        ]
    }

    #[test]
    fn includes_subfolders_via_delimiter() {
        let resolved = expand_folders(&[FolderSelection::new("INBOX")], &listing());
        assert_eq!(
            resolved,
            vec!["INBOX", "INBOX/Termine", "INBOX/Termine/2024"]
        );
    }

    #[test]
    fn honors_non_slash_delimiters() {
        let resolved = expand_folders(&[FolderSelection::new("Projekte")], &listing());
        assert_eq!(resolved, vec!["Projekte", "Projekte.Intern"]);
    }

    #[test]
    fn skips_subfolder_expansion_when_disabled() {
        let selection = FolderSelection {
            name: "INBOX".to_string(),
            include_subfolders: false,
        };
        assert_eq!(expand_folders(&[selection], &listing()), vec!["INBOX"]);
    }

    #[test]
    fn keeps_unknown_folders_without_duplicates() {
        let selections = vec![
            FolderSelection::new("Unbekannt"),
            FolderSelection::new("INBOX"),
            FolderSelection::new("INBOX/Termine"),
        ];
        let resolved = expand_folders(&selections, &listing());
        assert_eq!(
            resolved,
            vec!["Unbekannt", "INBOX", "INBOX/Termine", "INBOX/Termine/2024"]
        );
    }
}
