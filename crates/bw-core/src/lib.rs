pub mod wire;

pub use wire::{
    decode_reading, encode_frame, FrameError, NoticeStatus, ReadingStatus, RoomNotice,
    SensorReading, DEFAULT_MAX_FRAME_BYTES,
};
