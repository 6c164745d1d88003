mod pool;
mod publishers;
mod request_reply;
