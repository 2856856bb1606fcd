mod api;
mod e2e;
mod helpers;
