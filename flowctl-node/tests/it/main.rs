mod adapter;
mod coordinator;
mod flows;
