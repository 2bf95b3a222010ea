pub mod alert_repository;
pub mod market_data_repository;
pub mod notification_repository;
pub mod order_repository;
