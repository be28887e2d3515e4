//! Append-only step log with an undo/redo cursor.
//!
//! Steps live in an arena and are never mutated after creation; undo and
//! redo only move the cursor. Appending while undone truncates the skipped
//! tail first, so the active range is always a prefix of the arena.

use std::ops::Range;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::caps::RuntimeCapabilities;
use crate::error::{StepError, TranspileError};
use crate::events::{CursorMove, EngineEvent, EventCallback};
use crate::registry::FunctionRegistry;
use crate::state::TableState;
use crate::step::{ApplyContext, Step, StepKind};
use crate::transpiler::{self, LiteralSelection, ParameterizedCode};

pub struct StepsManager {
    initial_state: Arc<TableState>,
    steps: Vec<Step>,
    /// Steps below the cursor are active; the rest are undone.
    cursor: usize,
    /// Bumped on every log or cursor change. Lets callers discard results
    /// computed against an older shape of the log.
    revision: u64,
    registry: FunctionRegistry,
    capabilities: RuntimeCapabilities,
    events: Option<EventCallback>,
}

impl StepsManager {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self::with_capabilities(registry, RuntimeCapabilities::default())
    }

    pub fn with_capabilities(registry: FunctionRegistry, capabilities: RuntimeCapabilities) -> Self {
        Self {
            initial_state: Arc::new(TableState::new_session()),
            steps: Vec::new(),
            cursor: 0,
            revision: 0,
            registry,
            capabilities,
            events: None,
        }
    }

    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.events = Some(callback);
    }

    fn emit(&mut self, event: EngineEvent) {
        if let Some(callback) = &mut self.events {
            callback(event);
        }
    }

    // ========================================================================
    // Log access
    // ========================================================================

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn capabilities(&self) -> RuntimeCapabilities {
        self.capabilities
    }

    pub fn session_id(&self) -> &str {
        self.initial_state.session_id()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn active_steps(&self) -> &[Step] {
        &self.steps[..self.cursor]
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Snapshot after the last active step (the initial state when the
    /// cursor sits at zero).
    pub fn final_state(&self) -> Arc<TableState> {
        match self.cursor.checked_sub(1) {
            Some(last) => self.steps[last].post_state.clone(),
            None => self.initial_state.clone(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True when `revision` still describes the current log shape. Results
    /// computed under an older revision must be thrown away.
    pub fn is_current_revision(&self, revision: u64) -> bool {
        self.revision == revision
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Apply `kind` to the final state and append the resulting step. Any
    /// undone tail is discarded first. On error the log is untouched.
    pub fn append(&mut self, kind: StepKind) -> Result<usize, StepError> {
        let prev = self.final_state();
        let ctx = ApplyContext { registry: &self.registry, capabilities: self.capabilities };
        let post = kind.apply(&prev, &ctx)?;

        if self.cursor < self.steps.len() {
            let discarded = self.steps.len() - self.cursor;
            self.steps.truncate(self.cursor);
            self.revision += 1;
            let revision = self.revision;
            self.emit(EngineEvent::HistoryTruncated { discarded, revision });
        }

        let index = self.steps.len();
        let display_name = kind.display_name().to_string();
        self.steps.push(Step { index, prev_state: prev, post_state: post, kind });
        self.cursor += 1;
        self.revision += 1;
        let revision = self.revision;
        self.emit(EngineEvent::StepApplied { index, revision, display_name });
        Ok(index)
    }

    /// Move the cursor back one step. Returns false at the log start.
    pub fn undo(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor -= 1;
        self.revision += 1;
        let (cursor, revision) = (self.cursor, self.revision);
        self.emit(EngineEvent::CursorMoved { cursor, revision, direction: CursorMove::Undo });
        true
    }

    /// Move the cursor forward one step. Returns false at the log end.
    pub fn redo(&mut self) -> bool {
        if self.cursor == self.steps.len() {
            return false;
        }
        self.cursor += 1;
        self.revision += 1;
        let (cursor, revision) = (self.cursor, self.revision);
        self.emit(EngineEvent::CursorMoved { cursor, revision, direction: CursorMove::Redo });
        true
    }

    // ========================================================================
    // Code generation
    // ========================================================================

    fn active_range(&self, range: Range<usize>) -> &[Step] {
        let end = range.end.min(self.cursor);
        &self.steps[range.start.min(end)..end]
    }

    /// Script reproducing every active step, with adjacent compatible
    /// replace steps merged.
    pub fn code(&self) -> String {
        self.code_for_range(0..self.cursor)
    }

    /// Script for the active steps inside `range` (arena indices, clamped
    /// to the cursor).
    pub fn code_for_range(&self, range: Range<usize>) -> String {
        transpiler::transpile(&coalesce(self.active_range(range)), &self.registry)
    }

    /// Like [`code_for_range`](Self::code_for_range), lifted into a reusable
    /// function. Selections index into the coalesced step sequence of the
    /// range, in emission order.
    pub fn parameterize(
        &self,
        range: Range<usize>,
        selections: &[LiteralSelection],
    ) -> Result<ParameterizedCode, TranspileError> {
        transpiler::parameterize(&coalesce(self.active_range(range)), &self.registry, selections)
    }

    /// Table indices edited by active steps in `range` (arena indices).
    /// Exports read tables without editing them, so pure export ranges
    /// come back empty.
    pub fn tables_edited_in(&self, range: Range<usize>) -> FxHashSet<usize> {
        let end = range.end.min(self.cursor);
        let mut edited = FxHashSet::default();
        for step in &self.steps[range.start.min(end)..end] {
            edited.extend(step.edited_table_indices());
        }
        edited
    }
}

// ============================================================================
// Replace coalescing
// ============================================================================

/// True for literals safe to chain: no regex metacharacters, no text that
/// could interact with a surrounding pattern.
fn plain_literal(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-')
}

/// Whether `search` already occurs (case-insensitively) in the selected
/// columns or headers of `step`'s prev state. If it does, a later replace
/// of `search` would have hit that pre-existing text too, and merging
/// would change meaning.
fn search_preexists(step: &Step, search: &str) -> bool {
    let StepKind::Replace { table_index, column_ids, .. } = &step.kind else {
        return true;
    };
    let Some(table) = step.prev_state.table(*table_index) else {
        return true;
    };
    let Ok(re) = regex::Regex::new(&format!("(?i){}", regex::escape(search))) else {
        return true;
    };
    let columns: Vec<&crate::state::Column> = if column_ids.is_empty() {
        table.columns.iter().collect()
    } else {
        column_ids.iter().filter_map(|id| table.column_by_id(id)).collect()
    };
    for col in columns {
        if re.is_match(&col.header) {
            return true;
        }
        for value in &col.values {
            if let Some(text) = value.to_text() {
                if re.is_match(&text) {
                    return true;
                }
            }
        }
    }
    false
}

/// Merge runs of chained replace steps (second searches exactly what the
/// first wrote) into single steps. This shrinks the generated code only:
/// the arena keeps the original steps, and the merged step reuses the
/// first step's prev state and the second's post state, so no state is
/// ever recomputed.
fn coalesce(steps: &[Step]) -> Vec<Step> {
    let mut out: Vec<Step> = Vec::with_capacity(steps.len());
    for step in steps {
        let merged = match out.last() {
            Some(last) => try_merge(last, step),
            None => None,
        };
        match merged {
            Some(m) => *out.last_mut().expect("non-empty after merge") = m,
            None => out.push(step.clone()),
        }
    }
    out
}

fn try_merge(first: &Step, second: &Step) -> Option<Step> {
    let StepKind::Replace {
        table_index: first_table,
        column_ids: first_cols,
        search_value: first_search,
        replace_value: first_replace,
    } = &first.kind
    else {
        return None;
    };
    let StepKind::Replace {
        table_index: second_table,
        column_ids: second_cols,
        search_value: second_search,
        replace_value: second_replace,
    } = &second.kind
    else {
        return None;
    };

    if first_table != second_table || first_cols != second_cols {
        return None;
    }
    if second_search != first_replace {
        return None;
    }
    if ![first_search, first_replace, second_search, second_replace]
        .iter()
        .all(|s| plain_literal(s))
    {
        return None;
    }
    if search_preexists(first, second_search) {
        return None;
    }

    Some(Step {
        index: first.index,
        prev_state: first.prev_state.clone(),
        post_state: second.post_state.clone(),
        kind: StepKind::Replace {
            table_index: *first_table,
            column_ids: first_cols.clone(),
            search_value: first_search.clone(),
            replace_value: second_replace.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EngineEvent, EventCollector};
    use crate::state::{CellValue, Dtype, HeaderFormat};
    use crate::step::NewColumn;

    fn manager() -> StepsManager {
        StepsManager::new(FunctionRegistry::new())
    }

    fn create_kind(name: &str, values: &[i64]) -> StepKind {
        StepKind::CreateTable {
            name: name.into(),
            columns: vec![NewColumn {
                id: "A".into(),
                header: "A".into(),
                dtype: Dtype::Int64,
                values: values.iter().map(|&n| CellValue::Int(n)).collect(),
            }],
            header_format: HeaderFormat::default(),
        }
    }

    fn replace_kind(search: &str, replace: &str) -> StepKind {
        StepKind::Replace {
            table_index: 0,
            column_ids: vec![],
            search_value: search.into(),
            replace_value: replace.into(),
        }
    }

    #[test]
    fn test_append_undo_redo_cursor() {
        let mut m = manager();
        m.append(create_kind("t", &[1])).unwrap();
        m.append(replace_kind("1", "2")).unwrap();
        assert_eq!(m.cursor(), 2);
        assert_eq!(m.final_state().table(0).unwrap().columns[0].values, vec![CellValue::Int(2)]);

        assert!(m.undo());
        assert_eq!(m.cursor(), 1);
        assert_eq!(m.final_state().table(0).unwrap().columns[0].values, vec![CellValue::Int(1)]);

        assert!(m.undo());
        assert_eq!(m.final_state().table_count(), 0);
        assert!(!m.undo(), "undo at the log start is a no-op");

        assert!(m.redo());
        assert!(m.redo());
        assert!(!m.redo(), "redo at the log end is a no-op");
        assert_eq!(m.final_state().table(0).unwrap().columns[0].values, vec![CellValue::Int(2)]);
    }

    #[test]
    fn test_redo_reuses_stored_state() {
        let mut m = manager();
        m.append(create_kind("t", &[1])).unwrap();
        let before = m.final_state();
        m.undo();
        m.redo();
        assert!(Arc::ptr_eq(&before, &m.final_state()), "redo must not recompute the snapshot");
    }

    #[test]
    fn test_append_after_undo_truncates_tail() {
        let mut m = manager();
        let collector = EventCollector::new();
        m.set_event_callback(collector.callback());

        m.append(create_kind("t", &[1])).unwrap();
        m.append(replace_kind("1", "2")).unwrap();
        m.append(replace_kind("2", "3")).unwrap();
        m.undo();
        m.undo();
        m.append(replace_kind("1", "9")).unwrap();

        assert_eq!(m.len(), 2, "the two undone steps are gone");
        assert_eq!(m.cursor(), 2);
        assert!(!m.redo(), "nothing left to redo once the tail is discarded");
        assert_eq!(m.final_state().table(0).unwrap().columns[0].values, vec![CellValue::Int(9)]);

        let truncations: Vec<usize> = collector
            .events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::HistoryTruncated { discarded, .. } => Some(discarded),
                _ => None,
            })
            .collect();
        assert_eq!(truncations, vec![2]);
    }

    #[test]
    fn test_failed_append_leaves_log_untouched() {
        let mut m = manager();
        m.append(create_kind("t", &[1])).unwrap();
        let revision = m.revision();

        let err = m.append(replace_kind("1", "not a number")).unwrap_err();
        assert!(matches!(err, StepError::TypeConversion { .. }));
        assert_eq!(m.len(), 1);
        assert_eq!(m.cursor(), 1);
        assert_eq!(m.revision(), revision, "a failed apply must not bump the revision");
        assert_eq!(m.final_state().table(0).unwrap().columns[0].values, vec![CellValue::Int(1)]);
    }

    #[test]
    fn test_revision_tracks_every_change() {
        let mut m = manager();
        let r0 = m.revision();
        m.append(create_kind("t", &[1])).unwrap();
        let r1 = m.revision();
        assert!(r1 > r0);
        assert!(m.is_current_revision(r1));

        m.undo();
        assert!(!m.is_current_revision(r1), "undo invalidates results from before it");
        m.redo();
        assert!(!m.is_current_revision(r1), "revisions never repeat");
    }

    #[test]
    fn test_events_carry_step_metadata() {
        let mut m = manager();
        let collector = EventCollector::new();
        m.set_event_callback(collector.callback());

        m.append(create_kind("t", &[1])).unwrap();
        m.undo();
        m.redo();

        let events = collector.events();
        match &events[0] {
            EngineEvent::StepApplied { index, display_name, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(display_name, "Create Table");
            }
            other => panic!("expected StepApplied, got {:?}", other),
        }
        assert!(matches!(
            events[1],
            EngineEvent::CursorMoved { cursor: 0, direction: CursorMove::Undo, .. }
        ));
        assert!(matches!(
            events[2],
            EngineEvent::CursorMoved { cursor: 1, direction: CursorMove::Redo, .. }
        ));
    }

    #[test]
    fn test_code_covers_only_active_steps() {
        let mut m = manager();
        m.append(create_kind("t", &[1])).unwrap();
        m.append(StepKind::ExportCsv { targets: vec![(0, "out.csv".into())] }).unwrap();
        assert!(m.code().contains("tab.to_csv"));

        m.undo();
        assert!(!m.code().contains("tab.to_csv"), "undone steps emit no code");

        m.undo();
        assert_eq!(m.code(), "", "empty active range transpiles to nothing");
    }

    #[test]
    fn test_code_for_range_subsets_the_log() {
        let mut m = manager();
        m.append(create_kind("t", &[1])).unwrap();
        m.append(StepKind::ExportCsv { targets: vec![(0, "out.csv".into())] }).unwrap();

        let tail = m.code_for_range(1..2);
        assert!(tail.contains("tab.to_csv"), "{}", tail);
        assert!(!tail.contains("tab.from_columns"), "{}", tail);

        // Out-of-bounds ranges clamp instead of panicking.
        assert_eq!(m.code_for_range(5..9), "");
    }

    #[test]
    fn test_tables_edited_excludes_exports() {
        let mut m = manager();
        m.append(create_kind("a", &[1])).unwrap();
        m.append(create_kind("b", &[2])).unwrap();
        m.append(replace_kind("1", "5")).unwrap();
        m.append(StepKind::ExportCsv { targets: vec![(1, "b.csv".into())] }).unwrap();

        let edited = m.tables_edited_in(0..4);
        assert!(edited.contains(&0));
        assert!(edited.contains(&1));
        assert_eq!(edited.len(), 2);

        assert!(m.tables_edited_in(3..4).is_empty(), "exports never count as edits");
    }

    // ========================================================================
    // Coalescing
    // ========================================================================

    #[test]
    fn test_chained_replaces_coalesce_in_code() {
        let mut m = manager();
        m.append(create_kind("t", &[1])).unwrap();
        m.append(replace_kind("1", "2")).unwrap();
        m.append(replace_kind("2", "3")).unwrap();

        // States are unaffected by coalescing.
        assert_eq!(m.len(), 3);
        assert_eq!(m.final_state().table(0).unwrap().columns[0].values, vec![CellValue::Int(3)]);

        let code = m.code();
        let replace_lines = code.matches("tab.replace_pattern(").count();
        assert_eq!(replace_lines, 1, "chained replaces emit one substitution:\n{}", code);
        assert!(code.contains("\"(?i)1\""), "merged step searches the first pattern:\n{}", code);
        assert!(code.contains("\"3\""), "merged step writes the last replacement:\n{}", code);
        assert!(!code.contains("\"(?i)2\""), "intermediate value drops out:\n{}", code);
    }

    #[test]
    fn test_no_coalesce_when_search_preexists() {
        // Column already holds a 2, so "2" -> "3" must also hit that cell;
        // merging into "1" -> "3" would skip it.
        let mut m = manager();
        m.append(create_kind("t", &[1, 2])).unwrap();
        m.append(replace_kind("1", "2")).unwrap();
        m.append(replace_kind("2", "3")).unwrap();

        let code = m.code();
        assert_eq!(code.matches("tab.replace_pattern(").count(), 2, "{}", code);
    }

    #[test]
    fn test_no_coalesce_for_pattern_literals() {
        let mut m = manager();
        m.append(StepKind::CreateTable {
            name: "t".into(),
            columns: vec![NewColumn {
                id: "A".into(),
                header: "A".into(),
                dtype: Dtype::Str,
                values: vec![CellValue::Str("abc".into())],
            }],
            header_format: HeaderFormat::default(),
        })
        .unwrap();
        m.append(replace_kind("a.c", "x")).unwrap();
        m.append(replace_kind("x", "y")).unwrap();

        // "a.c" is a regex, not a plain literal, so the chain stays split.
        let code = m.code();
        assert_eq!(code.matches("tab.replace_pattern(").count(), 2, "{}", code);
    }

    #[test]
    fn test_no_coalesce_across_different_selections() {
        let mut m = manager();
        m.append(StepKind::CreateTable {
            name: "t".into(),
            columns: vec![
                NewColumn {
                    id: "A".into(),
                    header: "A".into(),
                    dtype: Dtype::Int64,
                    values: vec![CellValue::Int(1)],
                },
                NewColumn {
                    id: "B".into(),
                    header: "B".into(),
                    dtype: Dtype::Int64,
                    values: vec![CellValue::Int(1)],
                },
            ],
            header_format: HeaderFormat::default(),
        })
        .unwrap();
        m.append(StepKind::Replace {
            table_index: 0,
            column_ids: vec!["A".into()],
            search_value: "1".into(),
            replace_value: "2".into(),
        })
        .unwrap();
        m.append(StepKind::Replace {
            table_index: 0,
            column_ids: vec!["B".into()],
            search_value: "2".into(),
            replace_value: "3".into(),
        })
        .unwrap();

        let code = m.code();
        assert_eq!(code.matches("tab.replace_pattern(").count(), 2, "{}", code);
    }
}
