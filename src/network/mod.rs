/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

pub mod tls_config;
pub mod transport;
pub mod upstream;
