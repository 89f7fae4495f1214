pub mod feature;
pub mod feature_set;
pub mod geometry;
pub mod label_filter;
pub mod model;
pub mod nms;
pub mod progress;
pub mod raster;
pub mod region_filter;
pub mod sliding_window;
pub mod tile_service;
pub mod transform;
