// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_camera;
pub mod auto_tune;
pub mod config;
pub mod controller;
pub mod frame_output;
pub mod image_camera;
pub mod interactive;
pub mod metering;
pub mod operator_input;
pub mod overexposure_corrector;
pub mod select_camera;
