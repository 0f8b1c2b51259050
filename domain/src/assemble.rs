//! Comment-thread assembly.
//!
//! Turns the flat comment set of a single post into a forest of root comments
//! with recursively nested replies. Both backends feed this the same shape:
//! the relational backend from a recursive traversal query, the in-memory
//! backend from a filtered map scan, each already ordered by creation time
//! ascending. The assembler preserves that order within every sibling group.

use std::collections::{HashMap, HashSet};

use crate::Comment;

/// Build the reply forest for one post from its flat comment set.
///
/// Two passes: index the ids present in the input, then attach each comment
/// either to its parent's reply list or, if parentless, to the root list.
/// A comment whose declared parent is absent from the input is treated as a
/// root. Cycles are not defended against; cyclic input produces an
/// unspecified (possibly empty) nesting for the comments involved.
pub fn assemble_thread(flat: Vec<Comment>) -> Vec<Comment> {
    let known: HashSet<String> = flat.iter().map(|c| c.id.clone()).collect();

    let mut replies_of: HashMap<String, Vec<Comment>> = HashMap::new();
    let mut roots: Vec<Comment> = Vec::new();

    for comment in flat {
        let parent = comment
            .reply_to
            .as_deref()
            .filter(|p| known.contains(*p))
            .map(String::from);
        match parent {
            Some(parent) => replies_of.entry(parent).or_default().push(comment),
            None => roots.push(comment),
        }
    }

    for root in &mut roots {
        attach_replies(root, &mut replies_of);
    }
    roots
}

fn attach_replies(node: &mut Comment, replies_of: &mut HashMap<String, Vec<Comment>>) {
    if let Some(mut children) = replies_of.remove(&node.id) {
        for child in &mut children {
            attach_replies(child, replies_of);
        }
        node.replies = children;
    }
}
