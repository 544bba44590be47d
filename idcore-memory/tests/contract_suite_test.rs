//! Runs the shared backend contracts against the in-memory implementations.

use idcore_testing::contract::{event_store_contract_tests, handler_state_contract_tests};

event_store_contract_tests! {
    suite = in_memory_event_store,
    make_store = idcore_memory::InMemoryEventStore::new,
}

handler_state_contract_tests! {
    suite = in_memory_handler_state,
    make_store = idcore_memory::InMemoryHandlerStateStore::new,
}
