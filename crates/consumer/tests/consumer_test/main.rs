/// Integration tests for the consumer worker covering redelivery, restarts,
/// transient store failures and dead-lettering.

mod delivery;
mod failures;
mod helpers;
