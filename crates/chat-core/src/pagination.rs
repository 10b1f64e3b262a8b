use crate::ledger::MessageLedger;
use crate::model::{Message, MessageId, MessagePage};

/// Whether a "load older" request may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDecision {
    /// Issue one list call for messages older than `before`.
    Fetch { before: MessageId },
    /// The server said there is nothing further back.
    Exhausted,
    /// A previous load has not completed yet.
    InFlight,
    /// The ledger is empty, so there is no cursor to page from.
    NoCursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    /// Newly ingested messages, ascending by id.
    pub added: Vec<Message>,
    pub has_more: bool,
    pub oldest_id: Option<MessageId>,
}

/// Drives backwards pagination through history.
///
/// `has_more == false` is terminal for the session; after it no further
/// fetch is ever issued.
#[derive(Debug, Clone)]
pub struct PaginationController {
    has_more: bool,
    in_flight: Option<MessageId>,
}

impl Default for PaginationController {
    fn default() -> Self {
        Self::new()
    }
}

impl PaginationController {
    pub fn new() -> Self {
        Self {
            has_more: true,
            in_flight: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn in_flight(&self) -> Option<MessageId> {
        self.in_flight
    }

    /// Applies the newest page fetched at startup and adopts its `has_more`.
    pub fn seed(&mut self, page: MessagePage, ledger: &mut MessageLedger) -> PageOutcome {
        let outcome = self.merge(page, ledger);
        if outcome.added.is_empty() && ledger.is_empty() {
            self.has_more = false;
        }
        outcome
    }

    pub fn begin(&mut self, before: MessageId) -> LoadDecision {
        if !self.has_more {
            return LoadDecision::Exhausted;
        }
        if self.in_flight.is_some() {
            return LoadDecision::InFlight;
        }
        self.in_flight = Some(before);
        LoadDecision::Fetch { before }
    }

    /// Pages from the ledger's oldest known message.
    pub fn begin_from(&mut self, ledger: &MessageLedger) -> LoadDecision {
        if !self.has_more {
            return LoadDecision::Exhausted;
        }
        match ledger.oldest_id() {
            Some(oldest) => self.begin(oldest),
            None => LoadDecision::NoCursor,
        }
    }

    pub fn finish(&mut self, page: MessagePage, ledger: &mut MessageLedger) -> PageOutcome {
        self.in_flight = None;
        let empty = page.messages.is_empty();
        let mut outcome = self.merge(page, ledger);
        if empty {
            self.has_more = false;
            outcome.has_more = false;
        }
        outcome
    }

    /// A failed request frees the slot without touching `has_more`.
    pub fn abort(&mut self) {
        self.in_flight = None;
    }

    fn merge(&mut self, page: MessagePage, ledger: &mut MessageLedger) -> PageOutcome {
        if !page.has_more {
            self.has_more = false;
        }
        let added = ledger.ingest_batch(page.messages);
        PageOutcome {
            added,
            has_more: self.has_more,
            oldest_id: ledger.oldest_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn message(id: MessageId) -> Message {
        Message::new(id, 1, "history", OffsetDateTime::UNIX_EPOCH)
    }

    fn page(ids: &[MessageId], has_more: bool) -> MessagePage {
        MessagePage {
            messages: ids.iter().copied().map(message).collect(),
            has_more,
        }
    }

    #[test]
    fn final_page_moves_cursor_and_stops_paging() {
        let mut ledger = MessageLedger::new();
        ledger.ingest(message(100));
        let mut controller = PaginationController::new();

        assert_eq!(controller.begin(100), LoadDecision::Fetch { before: 100 });
        // Server returned newest-first; order must not matter.
        let outcome = controller.finish(page(&[95, 90], false), &mut ledger);
        assert_eq!(outcome.oldest_id, Some(90));
        assert_eq!(ledger.oldest_id(), Some(90));
        assert!(!outcome.has_more);
        assert_eq!(controller.begin_from(&ledger), LoadDecision::Exhausted);
        assert_eq!(controller.begin(90), LoadDecision::Exhausted);
    }

    #[test]
    fn empty_page_leaves_cursor_and_is_terminal() {
        let mut ledger = MessageLedger::new();
        ledger.ingest(message(50));
        let mut controller = PaginationController::new();
        controller.begin(50);
        let outcome = controller.finish(page(&[], true), &mut ledger);
        assert!(outcome.added.is_empty());
        assert_eq!(ledger.oldest_id(), Some(50));
        assert!(!controller.has_more());
    }

    #[test]
    fn one_load_at_a_time() {
        let mut ledger = MessageLedger::new();
        ledger.ingest(message(10));
        let mut controller = PaginationController::new();
        assert_eq!(controller.begin_from(&ledger), LoadDecision::Fetch { before: 10 });
        assert_eq!(controller.begin_from(&ledger), LoadDecision::InFlight);
        controller.abort();
        assert!(controller.has_more());
        assert_eq!(controller.begin_from(&ledger), LoadDecision::Fetch { before: 10 });
    }

    #[test]
    fn duplicate_history_is_not_reported_twice() {
        let mut ledger = MessageLedger::new();
        ledger.ingest(message(20));
        ledger.ingest(message(15));
        let mut controller = PaginationController::new();
        controller.begin(15);
        let outcome = controller.finish(page(&[15, 12, 11], true), &mut ledger);
        let ids: Vec<_> = outcome.added.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![11, 12]);
        assert!(controller.has_more());
    }

    #[test]
    fn seeding_an_empty_conversation_disables_paging() {
        let mut ledger = MessageLedger::new();
        let mut controller = PaginationController::new();
        controller.seed(page(&[], false), &mut ledger);
        assert_eq!(controller.begin_from(&ledger), LoadDecision::Exhausted);

        let mut ledger = MessageLedger::new();
        let mut controller = PaginationController::new();
        let outcome = controller.seed(page(&[30, 29], true), &mut ledger);
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(controller.begin_from(&ledger), LoadDecision::Fetch { before: 29 });
    }

    #[test]
    fn no_cursor_without_messages() {
        let ledger = MessageLedger::new();
        let mut controller = PaginationController::new();
        assert_eq!(controller.begin_from(&ledger), LoadDecision::NoCursor);
    }
}
