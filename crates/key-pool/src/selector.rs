//! Key selection
//!
//! Two phases. A bounded number of random draws handles the common case where
//! most keys are healthy without scanning the list. If every draw lands on a
//! cooling key, a full scan picks uniformly among the usable keys, or failing
//! that, the key whose cooldown ends soonest. Selection only fails on an
//! empty slice.

use rand::RngExt;

use crate::key::Key;

/// Random draws attempted before falling back to a full scan.
pub const FAST_PATH_DRAWS: usize = 10;

/// Pick a key for `model` using the current wall clock.
pub fn select<'a>(keys: &'a [Key], model: &str) -> Option<&'a Key> {
    select_at(keys, model, chrono::Utc::now().timestamp())
}

/// Pick a key for `model` as of `now` (unix seconds).
pub fn select_at<'a>(keys: &'a [Key], model: &str, now: i64) -> Option<&'a Key> {
    if keys.is_empty() {
        return None;
    }
    let mut rng = rand::rng();

    for _ in 0..FAST_PATH_DRAWS {
        let candidate = &keys[rng.random_range(0..keys.len())];
        if candidate.is_usable_for(model, now) {
            return Some(candidate);
        }
    }

    let usable: Vec<&Key> = keys.iter().filter(|k| k.is_usable_for(model, now)).collect();
    if !usable.is_empty() {
        return Some(usable[rng.random_range(0..usable.len())]);
    }

    // Everything is cooling: the soonest to recover may already have.
    keys.iter()
        .min_by_key(|k| k.cooling_end(model).unwrap_or(i64::MIN))
}
