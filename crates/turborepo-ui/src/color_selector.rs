use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use console::{Style, StyledObject};

/// Hands out colors round-robin and remembers the assignment, so a task id
/// renders with the same color for the whole run.
#[derive(Debug, Clone, Default)]
pub struct ColorSelector {
    inner: Arc<Mutex<HashMap<String, Style>>>,
    next: Arc<AtomicUsize>,
}

fn color_cycle() -> &'static [Style] {
    static CYCLE: OnceLock<Vec<Style>> = OnceLock::new();
    CYCLE.get_or_init(|| {
        vec![
            Style::new().cyan(),
            Style::new().magenta(),
            Style::new().green(),
            Style::new().yellow(),
            Style::new().blue(),
            Style::new().red(),
        ]
    })
}

impl ColorSelector {
    pub fn color_for_key(&self, key: &str) -> Style {
        let mut assignments = self.inner.lock().expect("color selector mutex poisoned");
        if let Some(style) = assignments.get(key) {
            return style.clone();
        }
        let cycle = color_cycle();
        let style = cycle[self.next.fetch_add(1, Ordering::Relaxed) % cycle.len()].clone();
        assignments.insert(key.to_string(), style.clone());
        style
    }

    pub fn prefix_with_color(&self, key: &str, prefix: &str) -> StyledObject<String> {
        if prefix.is_empty() {
            return Style::new().apply_to(String::new());
        }
        self.color_for_key(key).apply_to(format!("{prefix}: "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_color_is_stable_per_key() {
        let selector = ColorSelector::default();
        let first = selector.color_for_key("app#build");
        let second = selector.color_for_key("app#build");
        assert_eq!(format!("{first:?}"), format!("{second:?}"));
    }

    #[test]
    fn test_distinct_keys_cycle() {
        let selector = ColorSelector::default();
        let a = selector.color_for_key("a");
        let b = selector.color_for_key("b");
        assert_ne!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn test_empty_prefix_is_unstyled() {
        let selector = ColorSelector::default();
        assert_eq!(selector.prefix_with_color("a", "").to_string(), "");
    }
}
