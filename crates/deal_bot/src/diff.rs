use std::fmt;

use chrono::{DateTime, Utc};
use marketplace_api::Favorite;

/// One field that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Field name.
    pub field: &'static str,
    /// Rendered old value.
    pub old: String,
    /// Rendered new value.
    pub new: String,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.old, self.new)
    }
}

/// A list of field changes, rendered comma-separated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff(pub Vec<FieldChange>);

impl SnapshotDiff {
    /// Whether no field changed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names of the changed fields.
    pub fn fields(&self) -> Vec<&'static str> {
        self.0.iter().map(|change| change.field).collect()
    }
}

impl fmt::Display for SnapshotDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, change) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{change}")?;
        }
        Ok(())
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(|| "none".to_string(), |t| t.to_rfc3339())
}

/// Lists the fields that differ between `old` and `new`, in declaration order.
pub fn snapshot_diff(old: &Favorite, new: &Favorite) -> SnapshotDiff {
    let mut changes = Vec::new();
    let mut compare = |field: &'static str, old: String, new: String| {
        if old != new {
            changes.push(FieldChange { field, old, new });
        }
    };

    compare("name", old.name.clone(), new.name.clone());
    compare("tag", old.tag.to_string(), new.tag.to_string());
    compare(
        "num_available",
        old.num_available.to_string(),
        new.num_available.to_string(),
    );
    compare(
        "in_sales_window",
        old.in_sales_window.to_string(),
        new.in_sales_window.to_string(),
    );
    compare("sold_out_at", timestamp(old.sold_out_at), timestamp(new.sold_out_at));
    compare("next_drop", timestamp(old.next_drop), timestamp(new.next_drop));
    compare(
        "packaging",
        format!("{:?}", old.packaging),
        format!("{:?}", new.packaging),
    );

    SnapshotDiff(changes)
}
