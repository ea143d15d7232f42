//! Build version resolution from git history
//!
//! The version string is derived from the nearest reachable tag:
//! `<tag>` when HEAD is tagged, otherwise `<tag>-<distance>-<commit>`,
//! where distance is the number of edges on the shortest parent path
//! from HEAD to a tagged commit. Repos without tags fall back to `0.0.0`.

use git2::{Oid, Repository};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

/// Resolved version information for a checkout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    /// Nearest reachable tag, `v` prefix stripped
    pub tag: Option<String>,
    /// HEAD commit hash
    pub commit: Option<String>,
    /// Shortest-path distance from HEAD to the tagged commit
    pub distance: usize,
}

impl VersionInfo {
    /// Short (7 character) commit hash, empty when unknown
    pub fn commit_short(&self) -> &str {
        match &self.commit {
            Some(c) if c.len() >= 7 => &c[..7],
            Some(c) => c,
            None => "",
        }
    }

    /// The tag portion of the version, `0.0.0` when no tag is reachable
    pub fn tag_version(&self) -> &str {
        self.tag.as_deref().unwrap_or("0.0.0")
    }

    /// Full version string
    pub fn version(&self) -> String {
        let commit = self.commit_short();
        if commit.is_empty() || self.distance == 0 {
            return self.tag_version().to_string();
        }
        format!("{}-{}-{}", self.tag_version(), self.distance, commit)
    }
}

/// Resolve version info for the repository at `path`.
/// A directory that is not a git repository yields the empty info.
pub fn resolve(path: &Path) -> VersionInfo {
    let Ok(repo) = Repository::open(path) else {
        return VersionInfo::default();
    };
    resolve_repo(&repo)
}

fn resolve_repo(repo: &Repository) -> VersionInfo {
    let Ok(head) = repo.head() else {
        return VersionInfo::default();
    };
    let Some(head_oid) = head.target() else {
        return VersionInfo::default();
    };

    let mut info = VersionInfo {
        commit: Some(head_oid.to_string()),
        ..Default::default()
    };

    let tags = tagged_commits(repo);
    if tags.is_empty() {
        return info;
    }

    if let Some((tag, distance)) = nearest_tag(repo, head_oid, &tags) {
        info.tag = Some(tag.trim_start_matches('v').to_string());
        info.distance = distance;
    }
    info
}

/// Map of commit id to tag name, annotated tags peeled to their targets
fn tagged_commits(repo: &Repository) -> HashMap<Oid, String> {
    let mut tags = HashMap::new();
    let Ok(refs) = repo.references_glob("refs/tags/*") else {
        return tags;
    };
    for reference in refs.flatten() {
        let Some(name) = reference.shorthand().map(str::to_string) else {
            continue;
        };
        if let Ok(commit) = reference.peel_to_commit() {
            tags.insert(commit.id(), name);
        }
    }
    tags
}

/// Breadth-first walk over parent edges from `start`, returning the first
/// tagged commit hit and its distance in edges.
fn nearest_tag(
    repo: &Repository,
    start: Oid,
    tags: &HashMap<Oid, String>,
) -> Option<(String, usize)> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back((start, 0usize));
    visited.insert(start);

    while let Some((oid, distance)) = queue.pop_front() {
        if let Some(tag) = tags.get(&oid) {
            return Some((tag.clone(), distance));
        }
        let Ok(commit) = repo.find_commit(oid) else {
            continue;
        };
        for parent in commit.parent_ids() {
            if visited.insert(parent) {
                queue.push_back((parent, distance + 1));
            }
        }
    }
    None
}
